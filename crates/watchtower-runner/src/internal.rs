//! Runner for the compliance application's own database

use crate::executor::QueryExecutor;
use crate::runner::{RunOutput, RunRequest, Runner};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use watchtower_core::Result;
use watchtower_query::{substitute_logical_tables, Registry};

/// Expands logical tables for the tenant and runs the result on the
/// internal store
pub struct InternalRunner {
    registry: Arc<Registry>,
    executor: Arc<dyn QueryExecutor>,
}

impl InternalRunner {
    pub fn new(registry: Arc<Registry>, executor: Arc<dyn QueryExecutor>) -> Self {
        Self { registry, executor }
    }
}

#[async_trait]
impl Runner for InternalRunner {
    fn name(&self) -> &str {
        "internal"
    }

    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunOutput> {
        let sql = substitute_logical_tables(&request.query, &self.registry, &request.build)?;
        debug!(tenant = %request.tenant, "Running internal query");
        let data = self.executor.query(&sql, cancel).await?;
        Ok(RunOutput::single(data))
    }
}
