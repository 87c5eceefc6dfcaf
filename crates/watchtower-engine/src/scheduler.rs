//! Scheduler entrypoints
//!
//! Each entrypoint is an idempotent job a host scheduler can call from any
//! number of workers: provision the tenant's gateway profiles, bind missing
//! monitors, then evaluate the selected tenant monitors on the worker pool.
//! Evaluation failures are collected into the job summary; they never abort
//! the job.

use crate::evaluator::{Evaluation, Evaluator};
use crate::events::{group_changes, EventDispatcher, ResourceChange};
use crate::exclusions::ExclusionService;
use crate::runtime::Runtime;
use crate::stats::StatsSnapshot;
use crate::watchers::WatcherManager;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use watchtower_core::{
    Error, Monitor, MonitorId, MonitorKind, Result, TenantId, TenantMonitor, TenantMonitorId,
    UserId,
};
use watchtower_query::Registry;
use watchtower_store::Store;

/// Structured outcome of one job
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobSummary {
    pub job: String,

    /// Wall-clock seconds
    pub execution_time: f64,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub per_org_time: BTreeMap<TenantId, f64>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    pub evaluated: usize,

    /// Tenant monitors bound during the job
    pub created: usize,

    /// Rows or files removed by housekeeping jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,

    pub stats: StatsSnapshot,
}

struct JobRun {
    summary: JobSummary,
    started: Instant,
    before: StatsSnapshot,
}

impl JobRun {
    fn start(job: &str, evaluator: &Evaluator) -> Self {
        Self {
            summary: JobSummary {
                job: job.to_string(),
                ..Default::default()
            },
            started: Instant::now(),
            before: evaluator.stats().snapshot(),
        }
    }

    fn error(&mut self, message: String) {
        warn!(job = %self.summary.job, "{message}");
        self.summary.errors.push(message);
    }

    fn finish(mut self, evaluator: &Evaluator) -> JobSummary {
        self.summary.execution_time = self.started.elapsed().as_secs_f64();
        self.summary.stats = evaluator.stats().snapshot().since(&self.before);
        info!(
            job = %self.summary.job,
            execution_time = self.summary.execution_time,
            evaluated = self.summary.evaluated,
            created = self.summary.created,
            errors = self.summary.errors.len(),
            "Job finished"
        );
        self.summary
    }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    runtime: Arc<Runtime>,
    evaluator: Arc<Evaluator>,
    watchers: Arc<WatcherManager>,
    events: EventDispatcher,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        runtime: Arc<Runtime>,
        evaluator: Arc<Evaluator>,
        watchers: Arc<WatcherManager>,
    ) -> Self {
        Self {
            events: EventDispatcher::new(store.clone(), registry),
            store,
            runtime,
            evaluator,
            watchers,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Refresh every active tenant
    pub async fn refresh_all(&self) -> Result<JobSummary> {
        let mut job = JobRun::start("refresh_all", &self.evaluator);
        for tenant in self.store.list_tenants().await? {
            if !tenant.active {
                debug!(tenant = %tenant.id, "Skipping inactive tenant");
                continue;
            }
            self.refresh(tenant.id, None, &mut job).await;
        }
        Ok(job.finish(&self.evaluator))
    }

    pub async fn refresh_tenant(&self, tenant: TenantId) -> Result<JobSummary> {
        self.ensure_active(tenant).await?;
        let mut job = JobRun::start("refresh_tenant", &self.evaluator);
        self.refresh(tenant, None, &mut job).await;
        Ok(job.finish(&self.evaluator))
    }

    /// Refresh only the tenant monitors that read tables mapping into `deps`
    pub async fn refresh_by_dependencies(
        &self,
        tenant: TenantId,
        deps: &BTreeSet<String>,
    ) -> Result<JobSummary> {
        self.ensure_active(tenant).await?;
        let mut job = JobRun::start("refresh_by_dependencies", &self.evaluator);
        self.refresh(tenant, Some(deps), &mut job).await;
        Ok(job.finish(&self.evaluator))
    }

    /// Translate a burst of change signals into dependency refreshes
    pub async fn handle_changes(&self, changes: &[ResourceChange]) -> Result<JobSummary> {
        let mut job = JobRun::start("refresh_by_dependencies", &self.evaluator);
        for (tenant, deps) in group_changes(changes) {
            match self.store.get_tenant(tenant).await {
                Ok(found) if found.active => self.refresh(tenant, Some(&deps), &mut job).await,
                Ok(_) => debug!(tenant = %tenant, "Ignoring changes of inactive tenant"),
                Err(err) => job.error(format!("tenant {tenant}: {err}")),
            }
        }
        Ok(job.finish(&self.evaluator))
    }

    /// Evaluate one tenant monitor on the worker pool
    pub async fn run_tenant_monitor(
        &self,
        tenant_monitor: TenantMonitorId,
        user: Option<UserId>,
    ) -> Result<Evaluation> {
        let evaluator = self.evaluator.clone();
        let handle = self.runtime.pool().submit(
            format!("run {tenant_monitor}"),
            move |cancel| async move { evaluator.evaluate(tenant_monitor, user, &cancel).await },
        );
        handle
            .await
            .map_err(|err| Error::internal(format!("evaluation task failed: {err}")))?
    }

    /// Physically remove exclusions deleted longer than `retention` ago
    pub async fn sweep_exclusions(&self, retention: chrono::Duration) -> Result<JobSummary> {
        let job = JobRun::start("sweep_exclusions", &self.evaluator);
        let removed = ExclusionService::new(self.store.clone())
            .sweep(retention)
            .await?;
        let mut summary = job.finish(&self.evaluator);
        summary.removed = Some(removed);
        Ok(summary)
    }

    /// Remove gateway profiles no usable credential backs
    pub async fn clean_gateway(&self) -> Result<JobSummary> {
        let job = JobRun::start("clean_gateway", &self.evaluator);
        let removed = self.runtime.gateway().clean_environment().await?;
        let mut summary = job.finish(&self.evaluator);
        summary.removed = Some(removed);
        Ok(summary)
    }

    async fn ensure_active(&self, tenant: TenantId) -> Result<()> {
        if self.store.get_tenant(tenant).await?.active {
            Ok(())
        } else {
            Err(Error::invalid_state(format!("tenant {tenant} is inactive")))
        }
    }

    async fn refresh(&self, tenant: TenantId, deps: Option<&BTreeSet<String>>, job: &mut JobRun) {
        let started = Instant::now();

        if let Err(err) = self.runtime.gateway().provision_tenant(tenant).await {
            job.error(format!("tenant {tenant}: gateway provisioning failed: {err}"));
        }
        match self.materialize(tenant).await {
            Ok(created) => job.summary.created += created,
            Err(err) => job.error(format!("tenant {tenant}: binding monitors failed: {err}")),
        }

        let selected = match deps {
            Some(deps) => self.events.select(tenant, deps).await,
            None => self
                .store
                .list_tenant_monitors(tenant)
                .await
                .map(|all| all.into_iter().filter(|tm| tm.active).collect()),
        };
        let selected = match selected {
            Ok(selected) => selected,
            Err(err) => {
                job.error(format!("tenant {tenant}: listing monitors failed: {err}"));
                return;
            }
        };

        let handles: Vec<_> = selected
            .into_iter()
            .map(|tm| {
                let evaluator = self.evaluator.clone();
                let id = tm.id;
                let handle = self.runtime.pool().submit(format!("evaluate {id}"), move |cancel| {
                    async move { evaluator.evaluate(id, None, &cancel).await.map(|e| e.status()) }
                });
                (id, handle)
            })
            .collect();

        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(_)) => job.summary.evaluated += 1,
                Ok(Err(err)) => {
                    self.evaluator.stats().record_failure();
                    job.error(format!("tenant_monitor {id}: {err}"));
                }
                Err(err) => {
                    self.evaluator.stats().record_failure();
                    job.error(format!("tenant_monitor {id}: task failed: {err}"));
                }
            }
        }
        job.summary
            .per_org_time
            .insert(tenant, started.elapsed().as_secs_f64());
    }

    /// Bind every applicable monitor the tenant has no instance of.
    ///
    /// A System monitor is skipped when the tenant already runs it or one of
    /// its custom copies, and when its validation query finds nothing for
    /// the tenant. Returns the number of tenant monitors created.
    pub async fn materialize(&self, tenant: TenantId) -> Result<usize> {
        let bound: HashSet<MonitorId> = self
            .store
            .list_tenant_monitors(tenant)
            .await?
            .into_iter()
            .map(|tm| tm.monitor)
            .collect();
        let cancel = CancellationToken::new();

        let mut created = 0;
        for monitor in self.store.list_monitors().await? {
            let applies = match monitor.kind {
                MonitorKind::System => true,
                MonitorKind::Custom => monitor.owner == Some(tenant),
            };
            if !applies || bound.contains(&monitor.id) {
                continue;
            }
            if monitor.kind == MonitorKind::System
                && self.has_bound_copy(&monitor, tenant, &bound).await?
            {
                continue;
            }

            match self.evaluator.check_validation(&monitor, tenant, &cancel).await {
                Ok(()) => {}
                Err(Error::ValidationFailure { .. }) => {
                    debug!(monitor = %monitor.id, tenant = %tenant, "Monitor does not apply to tenant");
                    continue;
                }
                Err(err) => {
                    warn!(monitor = %monitor.id, tenant = %tenant, error = %err, "Validation query failed");
                    continue;
                }
            }

            let tm = TenantMonitor::new(tenant, monitor.id);
            match self.store.insert_tenant_monitor(&tm).await {
                Ok(()) => {}
                Err(Error::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
            if let Err(err) = self.watchers.initialize(&tm).await {
                warn!(tenant_monitor = %tm.id, error = %err, "Watcher initialisation failed");
            }
            info!(tenant_monitor = %tm.id, monitor = %monitor.id, tenant = %tenant, "Tenant monitor created");
            created += 1;
        }
        Ok(created)
    }

    async fn has_bound_copy(
        &self,
        monitor: &Monitor,
        tenant: TenantId,
        bound: &HashSet<MonitorId>,
    ) -> Result<bool> {
        Ok(self
            .store
            .monitor_children(monitor.id)
            .await?
            .iter()
            .any(|child| child.owner == Some(tenant) && bound.contains(&child.id)))
    }
}
