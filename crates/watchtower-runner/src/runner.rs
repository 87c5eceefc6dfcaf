//! Runner abstraction
//!
//! A runner takes a monitor query that already carries its placeholder
//! columns and returns the raw table. Classification happens in the engine.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use watchtower_core::{QueryContext, Result, ResultData, TenantId};
use watchtower_query::BuildContext;

/// One query to run for one tenant
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tenant: TenantId,

    /// Query text after variable injection
    pub query: String,

    pub context: QueryContext,

    /// Tenant data needed to expand logical tables
    pub build: BuildContext,
}

impl RunRequest {
    pub fn new(build: BuildContext, query: impl Into<String>, context: QueryContext) -> Self {
        Self {
            tenant: build.tenant,
            query: query.into(),
            context,
            build,
        }
    }

    /// Same request with different query text
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..self.clone()
        }
    }
}

/// Result of one source inside a fanned-out run
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRun {
    /// Credential or profile the rows came from
    pub source: String,
    pub data: ResultData,
}

/// Everything a runner produced
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunOutput {
    /// Aggregated table
    pub data: ResultData,

    /// Per-source results when the runner fanned out; empty otherwise
    pub partials: Vec<PartialRun>,
}

impl RunOutput {
    pub fn single(data: ResultData) -> Self {
        Self {
            data,
            partials: Vec::new(),
        }
    }

    /// Output of a run that failed before returning rows
    pub fn failed(error: impl Into<String>) -> Self {
        Self::single(ResultData::from_error(error))
    }

    /// Concatenate per-source results: columns of the first source that has
    /// any, rows in source order
    pub fn aggregate(partials: Vec<PartialRun>) -> Self {
        let mut data = ResultData::default();
        for partial in &partials {
            if data.columns.is_empty() && !partial.data.columns.is_empty() {
                data.columns = partial.data.columns.clone();
            }
            data.data.extend(partial.data.data.iter().cloned());
        }
        if data.columns.is_empty() {
            data.error = partials
                .iter()
                .find_map(|partial| partial.data.error.clone())
                .or_else(|| Some("No connected accounts returned data".to_string()));
        }
        Self { data, partials }
    }

    pub fn has_rows(&self) -> bool {
        if self.partials.is_empty() {
            self.data.row_count() > 0
        } else {
            self.partials.iter().any(|p| p.data.row_count() > 0)
        }
    }
}

/// Executes monitor queries against one kind of backend
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunOutput>;
}
