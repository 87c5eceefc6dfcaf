//! Runner selection and result-size enforcement

use crate::runner::{RunOutput, RunRequest, Runner};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use watchtower_core::{Error, QueryContext, Result};

/// Largest serialized result that is kept
pub const DEFAULT_MAX_RESULT_BYTES: usize = 2 * 1024 * 1024;

/// Routes each request to the internal or the cloud runner
pub struct Dispatcher {
    internal: Arc<dyn Runner>,
    cloud: Arc<dyn Runner>,
    max_result_bytes: usize,
}

impl Dispatcher {
    pub fn new(internal: Arc<dyn Runner>, cloud: Arc<dyn Runner>) -> Self {
        Self {
            internal,
            cloud,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn with_max_result_bytes(mut self, max_result_bytes: usize) -> Self {
        self.max_result_bytes = max_result_bytes;
        self
    }

    pub fn max_result_bytes(&self) -> usize {
        self.max_result_bytes
    }

    pub fn runner_for(&self, context: QueryContext) -> &Arc<dyn Runner> {
        match context {
            QueryContext::Internal => &self.internal,
            QueryContext::Cloud(_) => &self.cloud,
        }
    }

    /// Run a request.
    ///
    /// Rejected queries fail; every other error, and any result above the
    /// size limit, becomes an output carrying only the error message.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunOutput> {
        let runner = self.runner_for(request.context);
        match runner.run(request, cancel).await {
            Ok(output) => self.enforce_limit(output),
            Err(err) if err.is_rejection() => Err(err),
            Err(err) => {
                warn!(
                    runner = runner.name(),
                    tenant = %request.tenant,
                    error = %err,
                    "Run failed"
                );
                Ok(RunOutput::failed(err.status_message()))
            }
        }
    }

    fn enforce_limit(&self, output: RunOutput) -> Result<RunOutput> {
        let size = output.data.serialized_len()?;
        if size > self.max_result_bytes {
            let err = Error::ResultTooLarge {
                size,
                limit: self.max_result_bytes,
            };
            warn!(size, limit = self.max_result_bytes, "Result too large");
            return Ok(RunOutput::failed(err.to_string()));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;
    use watchtower_core::{CloudVendor, ResultData};
    use watchtower_query::BuildContext;

    struct FixedRunner {
        name: &'static str,
        calls: AtomicUsize,
        outcome: fn() -> Result<RunOutput>,
    }

    impl FixedRunner {
        fn new(name: &'static str, outcome: fn() -> Result<RunOutput>) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                outcome,
            })
        }
    }

    #[async_trait]
    impl Runner for FixedRunner {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _: &RunRequest, _: &CancellationToken) -> Result<RunOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn rows() -> Result<RunOutput> {
        Ok(RunOutput::single(ResultData::new(
            vec!["name".into()],
            vec![vec![json!("x".repeat(64))]; 100],
        )))
    }

    fn request(context: QueryContext) -> RunRequest {
        RunRequest::new(BuildContext::new(Uuid::new_v4()), "select 1", context)
    }

    #[tokio::test]
    async fn test_routes_by_context() {
        let internal = FixedRunner::new("internal", rows);
        let cloud = FixedRunner::new("cloud", rows);
        let dispatcher = Dispatcher::new(internal.clone(), cloud.clone());

        let cancel = CancellationToken::new();
        dispatcher.run(&request(QueryContext::Internal), &cancel).await.unwrap();
        dispatcher
            .run(&request(QueryContext::Cloud(CloudVendor::Okta)), &cancel)
            .await
            .unwrap();
        assert_eq!(internal.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_result_replaced_by_error() {
        let dispatcher = Dispatcher::new(FixedRunner::new("internal", rows), FixedRunner::new("cloud", rows))
            .with_max_result_bytes(1024);
        let output = dispatcher
            .run(&request(QueryContext::Internal), &CancellationToken::new())
            .await
            .unwrap();
        let error = output.data.error.unwrap();
        assert!(error.starts_with("result is too large"), "{error}");
        assert!(output.data.data.is_empty());
    }

    #[tokio::test]
    async fn test_database_errors_degrade_but_rejections_fail() {
        let failing = FixedRunner::new("internal", || {
            Err(Error::database("relation \"x\" does not exist"))
        });
        let rejecting = FixedRunner::new("cloud", || Err(Error::unknown_table("secrets")));
        let dispatcher = Dispatcher::new(failing, rejecting);
        let cancel = CancellationToken::new();

        let output = dispatcher.run(&request(QueryContext::Internal), &cancel).await.unwrap();
        assert_eq!(output.data.error.as_deref(), Some("relation \"x\" does not exist"));

        let err = dispatcher
            .run(&request(QueryContext::Cloud(CloudVendor::Aws)), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_rejection());
    }
}
