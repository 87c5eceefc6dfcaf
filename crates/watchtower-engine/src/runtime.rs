//! Process-wide resources: the cloud gateway environment and the worker pool

use crate::pool::WorkerPool;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use watchtower_core::{Result, TenantId};
use watchtower_runner::CloudRunner;
use watchtower_store::Liveness;

/// Shared gateway configuration directory
#[async_trait]
pub trait GatewayEnvironment: Send + Sync {
    /// Write or refresh the tenant's profiles; returns usable credentials
    async fn provision_tenant(&self, tenant: TenantId) -> Result<usize>;

    /// Remove profiles no current credential backs; returns files removed
    async fn clean_environment(&self) -> Result<usize>;
}

#[async_trait]
impl GatewayEnvironment for CloudRunner {
    async fn provision_tenant(&self, tenant: TenantId) -> Result<usize> {
        CloudRunner::provision_tenant(self, tenant).await
    }

    async fn clean_environment(&self) -> Result<usize> {
        CloudRunner::clean_environment(self).await
    }
}

/// For deployments and tests without a cloud gateway
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGateway;

#[async_trait]
impl GatewayEnvironment for NoGateway {
    async fn provision_tenant(&self, _tenant: TenantId) -> Result<usize> {
        Ok(0)
    }

    async fn clean_environment(&self) -> Result<usize> {
        Ok(0)
    }
}

pub struct Runtime {
    pool: WorkerPool,
    liveness: Arc<dyn Liveness>,
    gateway: Arc<dyn GatewayEnvironment>,
    initialized: AtomicBool,
}

impl Runtime {
    pub fn new(
        pool_size: usize,
        liveness: Arc<dyn Liveness>,
        gateway: Arc<dyn GatewayEnvironment>,
    ) -> Self {
        Self {
            pool: WorkerPool::new(pool_size, liveness.clone()),
            liveness,
            gateway,
            initialized: AtomicBool::new(false),
        }
    }

    /// Check the store and sweep stale gateway profiles. Repeated calls are
    /// no-ops.
    pub async fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.liveness.ping().await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(err);
        }
        match self.gateway.clean_environment().await {
            Ok(removed) => info!(removed, pool = self.pool.size(), "Runtime initialised"),
            Err(err) => warn!(error = %err, "Gateway environment cleanup failed"),
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn gateway(&self) -> &Arc<dyn GatewayEnvironment> {
        &self.gateway
    }

    /// Cancel in-flight work and wait for it
    pub async fn teardown(&self) {
        self.pool.shutdown().await;
        self.initialized.store(false, Ordering::SeqCst);
    }
}
