//! Cloud runner tests against fake credentials, gateway and executor

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use watchtower_core::{CloudVendor, Error, QueryContext, Result, ResultData, TenantId};
use watchtower_query::BuildContext;
use watchtower_runner::{
    CloudRunner, Credential, CredentialProvider, CredentialStatus, GatewayControl,
    ProfileDirectory, QueryExecutor, RetryPolicy, RunRequest, Runner,
};

struct StaticCredentials {
    credentials: Mutex<Vec<Credential>>,
}

impl StaticCredentials {
    fn new(credentials: Vec<Credential>) -> Arc<Self> {
        Arc::new(Self {
            credentials: Mutex::new(credentials),
        })
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn list_credentials(&self, tenant: TenantId, vendor: CloudVendor) -> Result<Vec<Credential>> {
        Ok(self
            .credentials
            .lock()
            .iter()
            .filter(|c| c.tenant == tenant && c.vendor == vendor)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Credential>> {
        Ok(self.credentials.lock().clone())
    }
}

#[derive(Default)]
struct CountingGateway {
    restarts: AtomicUsize,
    reloads: AtomicUsize,
}

#[async_trait]
impl GatewayControl for CountingGateway {
    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails the first `failures` calls with a dropped connection, then echoes
/// the SQL it received as a single row
struct FlakyExecutor {
    failures: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl FlakyExecutor {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl QueryExecutor for FlakyExecutor {
    async fn query(&self, sql: &str, _cancel: &CancellationToken) -> Result<ResultData> {
        self.seen.lock().push(sql.to_string());
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::database("server closed the connection unexpectedly"));
        }
        Ok(ResultData::new(vec!["sql".into()], vec![vec![json!(sql)]]))
    }
}

fn aws_credential(tenant: TenantId) -> Credential {
    Credential {
        id: Uuid::new_v4(),
        tenant,
        vendor: CloudVendor::Aws,
        status: CredentialStatus::Success,
        auth_payload: json!({"access_key_id": "AKIA", "secret_access_key": "secret"}),
        updated_at: Utc::now(),
    }
}

struct Harness {
    runner: CloudRunner,
    gateway: Arc<CountingGateway>,
    executor: Arc<FlakyExecutor>,
    credentials: Arc<StaticCredentials>,
    _dir: tempfile::TempDir,
}

fn harness(credentials: Vec<Credential>, failures: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let credentials = StaticCredentials::new(credentials);
    let gateway = Arc::new(CountingGateway::default());
    let executor = FlakyExecutor::new(failures);
    let runner = CloudRunner::new(
        credentials.clone(),
        executor.clone(),
        gateway.clone(),
        ProfileDirectory::new(dir.path(), Duration::from_secs(50 * 60)),
    );
    Harness {
        runner,
        gateway,
        executor,
        credentials,
        _dir: dir,
    }
}

fn request(tenant: TenantId) -> RunRequest {
    RunRequest::new(
        BuildContext::new(tenant),
        "select name from aws_iam_user",
        QueryContext::Cloud(CloudVendor::Aws),
    )
}

#[tokio::test]
async fn test_fans_out_over_every_account() {
    let tenant = Uuid::new_v4();
    let first = aws_credential(tenant);
    let second = aws_credential(tenant);
    let h = harness(vec![first.clone(), second.clone(), aws_credential(Uuid::new_v4())], 0);

    let output = h.runner.run(&request(tenant), &CancellationToken::new()).await.unwrap();

    assert_eq!(output.partials.len(), 2);
    assert_eq!(output.data.row_count(), 2);
    let seen = h.executor.seen.lock().clone();
    assert!(seen.contains(&format!(
        "select name from {}.aws_iam_user",
        first.profile_name()
    )));
    assert!(seen.contains(&format!(
        "select name from {}.aws_iam_user",
        second.profile_name()
    )));
    assert!(h.runner.profiles().path_of(&first.profile_name()).exists());
    assert_eq!(h.gateway.reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_gateway_reloads_before_each_run() {
    let tenant = Uuid::new_v4();
    let h = harness(vec![aws_credential(tenant)], 0);
    let cancel = CancellationToken::new();

    h.runner.run(&request(tenant), &cancel).await.unwrap();
    h.runner.run(&request(tenant), &cancel).await.unwrap();
    assert_eq!(h.gateway.reloads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_provisioning_fresh_profiles_does_not_reload() {
    let tenant = Uuid::new_v4();
    let h = harness(vec![aws_credential(tenant)], 0);

    h.runner.provision(tenant, CloudVendor::Aws).await.unwrap();
    h.runner.provision(tenant, CloudVendor::Aws).await.unwrap();
    assert_eq!(h.gateway.reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_restart_and_retry() {
    let tenant = Uuid::new_v4();
    let h = harness(vec![aws_credential(tenant)], 2);

    let output = h.runner.run(&request(tenant), &CancellationToken::new()).await.unwrap();

    assert!(output.data.error.is_none());
    assert_eq!(output.data.row_count(), 1);
    assert_eq!(h.gateway.restarts.load(Ordering::SeqCst), 2);
    assert_eq!(h.executor.seen.lock().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_become_error_partial() {
    let tenant = Uuid::new_v4();
    let h = harness(vec![aws_credential(tenant)], 10);

    let output = h.runner.run(&request(tenant), &CancellationToken::new()).await.unwrap();

    assert_eq!(h.executor.seen.lock().len(), 3);
    assert_eq!(
        output.partials[0].data.error.as_deref(),
        Some("server closed the connection unexpectedly")
    );
    assert!(output.data.is_error());
    assert!(!output.has_rows());
}

#[tokio::test]
async fn test_no_retry_policy_fails_once() {
    let tenant = Uuid::new_v4();
    let mut h = harness(vec![aws_credential(tenant)], 1);
    h.runner = h.runner.with_retry(RetryPolicy::none());

    let output = h.runner.run(&request(tenant), &CancellationToken::new()).await.unwrap();
    assert!(output.data.is_error());
    assert_eq!(h.gateway.restarts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_usable_credentials() {
    let tenant = Uuid::new_v4();
    let mut pending = aws_credential(tenant);
    pending.status = CredentialStatus::Pending;
    let mut empty = aws_credential(tenant);
    empty.auth_payload = serde_json::Value::Null;
    let h = harness(vec![pending, empty], 0);

    let output = h.runner.run(&request(tenant), &CancellationToken::new()).await.unwrap();

    assert_eq!(output.data.error.as_deref(), Some("No connected aws accounts"));
    assert!(output.partials.is_empty());
    assert!(h.executor.seen.lock().is_empty());
    assert_eq!(h.gateway.reloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_misconfigured_credential_skipped() {
    let tenant = Uuid::new_v4();
    let good = aws_credential(tenant);
    let mut broken = aws_credential(tenant);
    broken.auth_payload = json!({"access_key_id": "AKIA"});
    let h = harness(vec![broken.clone(), good.clone()], 0);

    let output = h.runner.run(&request(tenant), &CancellationToken::new()).await.unwrap();

    assert_eq!(output.partials.len(), 1);
    assert_eq!(output.partials[0].source, good.id.to_string());
    assert!(!h.runner.profiles().path_of(&broken.profile_name()).exists());
}

#[tokio::test]
async fn test_clean_environment_drops_removed_accounts() {
    let tenant = Uuid::new_v4();
    let kept = aws_credential(tenant);
    let removed = aws_credential(tenant);
    let h = harness(vec![kept.clone(), removed.clone()], 0);
    h.runner.provision(tenant, CloudVendor::Aws).await.unwrap();

    h.credentials.credentials.lock().retain(|c| c.id == kept.id);
    let cleaned = h.runner.clean_environment().await.unwrap();

    assert_eq!(cleaned, 1);
    let profiles = h.runner.profiles();
    assert!(profiles.path_of(&kept.profile_name()).exists());
    assert!(!profiles.path_of(&removed.profile_name()).exists());
    let keep: HashSet<String> = HashSet::from([kept.profile_name()]);
    assert_eq!(profiles.clean(&keep).unwrap(), 0);
}

#[tokio::test]
async fn test_context_inferred_from_tables() {
    let tenant = Uuid::new_v4();
    let h = harness(vec![aws_credential(tenant)], 0);
    let request = RunRequest::new(
        BuildContext::new(tenant),
        "select name from aws_iam_user",
        QueryContext::Internal,
    );

    let output = h.runner.run(&request, &CancellationToken::new()).await.unwrap();
    assert_eq!(output.data.row_count(), 1);
}
