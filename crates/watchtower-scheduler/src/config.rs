//! Process configuration
//!
//! Read from an optional YAML file, then from `WATCHTOWER__SECTION__KEY`
//! environment variables. Every knob has a default, so an empty file is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use watchtower_engine::{EvaluatorConfig, NotificationConfig, ReconcilerConfig, DEFAULT_POOL_SIZE};
use watchtower_runner::cloud::{default_config_dir, DEFAULT_GATEWAY_DSN};
use watchtower_runner::{ExecutorConfig, GatewayCommands, RetryPolicy, DEFAULT_MAX_RESULT_BYTES};
use watchtower_store::PoolConfig;

const ENV_PREFIX: &str = "WATCHTOWER";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchtowerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    /// YAML file replacing the built-in typed object specs
    #[serde(default)]
    pub typed_objects: Option<PathBuf>,
}

impl WatchtowerConfig {
    /// Load `path` when it exists and layer the environment on top
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("engine.default_watcher_roles"),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// The store pool must be larger than the worker pool
    pub fn validate(&self) -> anyhow::Result<()> {
        let workers = self.engine.worker_pool_size;
        if workers == 0 {
            anyhow::bail!("engine.worker_pool_size must be > 0");
        }
        if (self.database.max_connections as usize) <= workers {
            anyhow::bail!(
                "database.max_connections ({}) must exceed engine.worker_pool_size ({})",
                self.database.max_connections,
                workers
            );
        }
        Ok(())
    }

    /// Store pool settings with one lock connection per worker
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            lock_connections: u32::try_from(self.engine.worker_pool_size).unwrap_or(u32::MAX),
            ..self.database.pool()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            ..PoolConfig::default()
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_connections: self.max_connections,
            statement_timeout: Duration::from_secs(self.statement_timeout_secs),
            ..ExecutorConfig::default()
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_dsn")]
    pub dsn: String,

    /// Directory the gateway reads connection profiles from
    #[serde(default)]
    pub config_dir: Option<PathBuf>,

    #[serde(default = "default_profile_max_age")]
    pub profile_max_age_mins: u64,

    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,

    #[serde(default)]
    pub restart_command: Option<String>,

    #[serde(default)]
    pub reload_command: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl GatewayConfig {
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(default_config_dir)
    }

    pub fn profile_max_age(&self) -> Duration {
        Duration::from_secs(self.profile_max_age_mins * 60)
    }

    pub fn commands(&self) -> GatewayCommands {
        GatewayCommands {
            restart_command: self.restart_command.clone(),
            reload_command: self.reload_command.clone(),
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            statement_timeout: Duration::from_secs(self.statement_timeout_secs),
            ..ExecutorConfig::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dsn: default_gateway_dsn(),
            config_dir: None,
            profile_max_age_mins: default_profile_max_age(),
            statement_timeout_secs: default_statement_timeout(),
            restart_command: None,
            reload_command: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,

    #[serde(default = "default_unfiltered_limit")]
    pub unfiltered_limit: u64,

    /// Roles whose holders watch every tenant monitor by default
    #[serde(default = "default_watcher_roles")]
    pub default_watcher_roles: Vec<String>,

    #[serde(default = "default_due_days")]
    pub action_item_due_days: i64,

    #[serde(default = "default_web_url")]
    pub web_url: String,

    #[serde(default = "default_retention_days")]
    pub exclusion_retention_days: i64,

    #[serde(default = "default_batch_size")]
    pub notification_batch_size: usize,
}

impl EngineConfig {
    pub fn evaluator(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            unfiltered_limit: self.unfiltered_limit,
            max_result_bytes: self.max_result_bytes,
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            action_item_due_days: self.action_item_due_days,
            web_url: self.web_url.clone(),
            notification_batch_size: self.notification_batch_size,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_pool_size(),
            max_result_bytes: default_max_result_bytes(),
            unfiltered_limit: default_unfiltered_limit(),
            default_watcher_roles: default_watcher_roles(),
            action_item_due_days: default_due_days(),
            web_url: default_web_url(),
            exclusion_retention_days: default_retention_days(),
            notification_batch_size: default_batch_size(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://watchtower@localhost:5432/watchtower".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout() -> u64 {
    120
}

fn default_gateway_dsn() -> String {
    DEFAULT_GATEWAY_DSN.to_string()
}

fn default_profile_max_age() -> u64 {
    50
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_max_result_bytes() -> usize {
    DEFAULT_MAX_RESULT_BYTES
}

fn default_unfiltered_limit() -> u64 {
    EvaluatorConfig::default().unfiltered_limit
}

fn default_watcher_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_due_days() -> i64 {
    ReconcilerConfig::default().action_item_due_days
}

fn default_web_url() -> String {
    ReconcilerConfig::default().web_url
}

fn default_retention_days() -> i64 {
    365
}

fn default_batch_size() -> usize {
    ReconcilerConfig::default().notification_batch_size
}
