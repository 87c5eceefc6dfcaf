//! Cloud inventory runner
//!
//! Queries against `aws_*`, `gcp_*`, `azure_*`/`azuread_*`, `heroku_*`,
//! `okta_*` and `digitalocean_*` tables run once per connected account of
//! the tenant. Every account gets its own gateway profile and the query is
//! qualified with that profile's schema before it runs.

pub mod credentials;
pub mod gateway;
pub mod profiles;
pub mod retry;

pub use credentials::{Credential, CredentialProvider, CredentialStatus, PgCredentialProvider};
pub use gateway::{
    default_config_dir, CommandGateway, GatewayCommands, GatewayControl, ProfileDirectory,
    DEFAULT_GATEWAY_DSN,
};
pub use profiles::build_profile;
pub use retry::RetryPolicy;

use crate::executor::QueryExecutor;
use crate::runner::{PartialRun, RunOutput, RunRequest, Runner};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use watchtower_core::{CloudVendor, Error, Result, ResultData, TenantId};
use watchtower_query::{infer_context, qualify_cloud_tables};

pub struct CloudRunner {
    credentials: Arc<dyn CredentialProvider>,
    executor: Arc<dyn QueryExecutor>,
    gateway: Arc<dyn GatewayControl>,
    profiles: ProfileDirectory,
    retry: RetryPolicy,
}

impl CloudRunner {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        executor: Arc<dyn QueryExecutor>,
        gateway: Arc<dyn GatewayControl>,
        profiles: ProfileDirectory,
    ) -> Self {
        Self {
            credentials,
            executor,
            gateway,
            profiles,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn profiles(&self) -> &ProfileDirectory {
        &self.profiles
    }

    /// Write missing or stale profiles for the tenant's usable credentials of
    /// one vendor and return those credentials.
    ///
    /// Credentials that cannot be turned into a profile are logged and
    /// skipped.
    pub async fn provision(
        &self,
        tenant: TenantId,
        vendor: CloudVendor,
    ) -> Result<Vec<Credential>> {
        let (ready, written) = self.write_profiles(tenant, vendor).await?;
        if written {
            self.reload_gateway().await;
        }
        Ok(ready)
    }

    async fn write_profiles(
        &self,
        tenant: TenantId,
        vendor: CloudVendor,
    ) -> Result<(Vec<Credential>, bool)> {
        let listed = self.credentials.list_credentials(tenant, vendor).await?;
        let now = Utc::now();

        let mut ready = Vec::new();
        let mut written = false;
        for credential in listed.into_iter().filter(Credential::is_usable) {
            let (credential, force) = if credential.needs_refresh(now) {
                match self.credentials.refresh(&credential).await {
                    Ok(fresh) => (fresh, true),
                    Err(err) => {
                        warn!(
                            credential = %credential.id,
                            error = %err,
                            "Credential refresh failed"
                        );
                        continue;
                    }
                }
            } else {
                (credential, false)
            };

            let contents = match build_profile(&credential) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(credential = %credential.id, error = %err, "Skipping credential");
                    continue;
                }
            };
            match self
                .profiles
                .ensure(&credential.profile_name(), &contents, force)
            {
                Ok(changed) => written |= changed,
                Err(err) => {
                    warn!(credential = %credential.id, error = %err, "Could not write profile");
                    continue;
                }
            }
            ready.push(credential);
        }

        debug!(
            tenant = %tenant,
            vendor = %vendor,
            credentials = ready.len(),
            "Profiles provisioned"
        );
        Ok((ready, written))
    }

    async fn reload_gateway(&self) {
        if let Err(err) = self.gateway.reload().await {
            warn!(error = %err, "Gateway reload failed");
        }
    }

    /// Provision every vendor for a tenant; returns the number of usable
    /// credentials
    pub async fn provision_tenant(&self, tenant: TenantId) -> Result<usize> {
        let mut total = 0;
        for vendor in CloudVendor::ALL {
            total += self.provision(tenant, vendor).await?.len();
        }
        Ok(total)
    }

    /// Remove profiles of credentials that are gone or no longer usable
    pub async fn clean_environment(&self) -> Result<usize> {
        let keep: HashSet<String> = self
            .credentials
            .list_all()
            .await?
            .iter()
            .filter(|credential| credential.is_usable())
            .map(Credential::profile_name)
            .collect();
        let removed = self.profiles.clean(&keep)?;
        if removed > 0 {
            self.reload_gateway().await;
        }
        Ok(removed)
    }

    async fn query_with_retry(&self, sql: &str, cancel: &CancellationToken) -> Result<ResultData> {
        let mut attempt = 1;
        loop {
            match self.executor.query(sql, cancel).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_transient() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Transient gateway error, restarting gateway"
                    );
                    metrics::counter!("watchtower_gateway_retries_total").increment(1);
                    if let Err(restart) = self.gateway.restart().await {
                        warn!(error = %restart, "Gateway restart failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Runner for CloudRunner {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunOutput> {
        let vendor = match request.context.vendor() {
            Some(vendor) => vendor,
            None => infer_context(&request.query)?
                .vendor()
                .ok_or_else(|| Error::invalid_state("query does not read any cloud table"))?,
        };

        let (credentials, _) = self.write_profiles(request.tenant, vendor).await?;
        if credentials.is_empty() {
            info!(tenant = %request.tenant, vendor = %vendor, "No connected accounts");
            return Ok(RunOutput::failed(format!("No connected {vendor} accounts")));
        }
        // Profiles may have been written by another worker since the last load
        self.reload_gateway().await;

        let mut partials = Vec::with_capacity(credentials.len());
        for credential in &credentials {
            let profile = credential.profile_name();
            let sql = qualify_cloud_tables(&request.query, &profile)?;
            let data = match self.query_with_retry(&sql, cancel).await {
                Ok(data) => data,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(credential = %credential.id, error = %err, "Cloud query failed");
                    ResultData::from_error(err.status_message())
                }
            };
            partials.push(PartialRun {
                source: credential.id.to_string(),
                data,
            });
        }
        Ok(RunOutput::aggregate(partials))
    }
}
