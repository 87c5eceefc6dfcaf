//! The cloud-query gateway: its configuration directory and process control

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use watchtower_core::{Error, Result};

/// Extension of connection profile files
pub const PROFILE_EXTENSION: &str = "spc";

/// Prefix shared by every profile this crate writes
pub const PROFILE_PREFIX: &str = "profile_";

/// Local gateway endpoint
pub const DEFAULT_GATEWAY_DSN: &str = "postgres://steampipe:@localhost:9193/steampipe";

/// Gateway configuration directory under the user's home
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".steampipe")
        .join("config")
}

/// Profile files shared by every worker on the host.
///
/// Writers go through a temporary file in the same directory and an atomic
/// rename, so the gateway never reads a half-written profile.
#[derive(Debug, Clone)]
pub struct ProfileDirectory {
    dir: PathBuf,
    max_age: Duration,
}

impl ProfileDirectory {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, profile: &str) -> PathBuf {
        self.dir.join(format!("{profile}.{PROFILE_EXTENSION}"))
    }

    /// Whether the profile is missing or older than the maximum age
    pub fn is_stale(&self, profile: &str) -> bool {
        match fs::metadata(self.path_of(profile)).and_then(|meta| meta.modified()) {
            Ok(modified) => age(modified) > self.max_age,
            Err(_) => true,
        }
    }

    /// Write the profile unless a fresh copy exists. Returns whether the file
    /// was (re)written.
    pub fn ensure(&self, profile: &str, contents: &str, force: bool) -> Result<bool> {
        if !force && !self.is_stale(profile) {
            return Ok(false);
        }
        self.write(profile, contents)?;
        Ok(true)
    }

    fn write(&self, profile: &str, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(self.path_of(profile))
            .map_err(|err| Error::Io(err.error))?;
        debug!(profile, "Wrote gateway profile");
        Ok(())
    }

    /// Remove profiles that are not in `keep` or have outlived the maximum
    /// age. Files not written by this crate are left alone.
    pub fn clean(&self, keep: &HashSet<String>) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(profile) = profile_name(&path) else {
                continue;
            };
            let expired = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map(|modified| age(modified) > self.max_age)
                .unwrap_or(true);
            if expired || !keep.contains(profile) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(path = %path.display(), error = %err, "Could not remove profile"),
                }
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "Cleaned gateway profiles");
        }
        Ok(removed)
    }
}

fn age(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}

fn profile_name(path: &Path) -> Option<&str> {
    if path.extension()?.to_str()? != PROFILE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.starts_with(PROFILE_PREFIX).then_some(stem)
}

/// Control over the gateway process
#[async_trait]
pub trait GatewayControl: Send + Sync {
    /// Restart after the gateway dropped connections or holds its port
    async fn restart(&self) -> Result<()>;

    /// Make the gateway pick up changed profiles
    async fn reload(&self) -> Result<()>;
}

/// Gateway commands run through the shell
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayCommands {
    #[serde(default)]
    pub restart_command: Option<String>,
    #[serde(default)]
    pub reload_command: Option<String>,
}

/// Runs the configured shell commands; an unset command is a no-op
#[derive(Debug, Clone, Default)]
pub struct CommandGateway {
    commands: GatewayCommands,
}

impl CommandGateway {
    pub fn new(commands: GatewayCommands) -> Self {
        Self { commands }
    }

    async fn run(&self, action: &'static str, command: Option<&str>) -> Result<()> {
        let Some(command) = command else {
            debug!(action, "No gateway command configured");
            return Ok(());
        };
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        if output.status.success() {
            info!(action, "Gateway command finished");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::GatewayTransient(format!(
                "gateway {action} failed with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl GatewayControl for CommandGateway {
    async fn restart(&self) -> Result<()> {
        self.run("restart", self.commands.restart_command.as_deref())
            .await
    }

    async fn reload(&self) -> Result<()> {
        self.run("reload", self.commands.reload_command.as_deref())
            .await
    }
}
