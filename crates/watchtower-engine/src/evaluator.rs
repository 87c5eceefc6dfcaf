//! One evaluation of one tenant monitor
//!
//! Under the tenant monitor's evaluation lock: resolve the effective query,
//! inject placeholder columns, run it through the dispatcher, filter rows by
//! active exclusions, classify, size-check, probe the unfiltered variant for
//! `no_data_detected`, then persist the result with its exclusion events in
//! one write. Action items are reconciled after the lock is released.

use crate::classifier::{aggregate, apply_no_data, classify, enforce_size};
use crate::exclusions::{filter, lifecycle_events, ExclusionService};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::stats::{record_exclusion_event, EvaluationStats};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use watchtower_core::{
    Error, Exclusion, ExclusionEvent, HealthCondition, Monitor, MonitorResult, QueryContext,
    Result, ResultData, Status, TenantId, TenantMonitor, TenantMonitorId, UserId,
};
use watchtower_query::{build_unfiltered, infer_context, inject_variables, validate, BuildContext, Registry};
use watchtower_runner::{Dispatcher, RunOutput, RunRequest, DEFAULT_MAX_RESULT_BYTES};
use watchtower_store::{EvaluationRecord, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Row limit of the unfiltered probe
    #[serde(default = "default_unfiltered_limit")]
    pub unfiltered_limit: u64,

    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
}

fn default_unfiltered_limit() -> u64 {
    10
}

fn default_max_result_bytes() -> usize {
    DEFAULT_MAX_RESULT_BYTES
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            unfiltered_limit: default_unfiltered_limit(),
            max_result_bytes: default_max_result_bytes(),
        }
    }
}

/// What one evaluation persisted and triggered
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: MonitorResult,
    pub exclusion_events: Vec<ExclusionEvent>,

    /// `None` when reconciliation failed; the failure is logged
    pub reconcile: Option<ReconcileOutcome>,
}

impl Evaluation {
    pub fn status(&self) -> Status {
        self.result.status
    }
}

pub struct Evaluator {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
    stats: EvaluationStats,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        reconciler: Arc<Reconciler>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            reconciler,
            stats: EvaluationStats::new(),
            config,
        }
    }

    pub fn stats(&self) -> &EvaluationStats {
        &self.stats
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Evaluate one tenant monitor.
    ///
    /// Rejected queries fail without writing anything; so does a cancelled
    /// run. Backend failures are persisted as `connection_error` results.
    pub async fn evaluate(
        &self,
        tenant_monitor: TenantMonitorId,
        user: Option<UserId>,
        cancel: &CancellationToken,
    ) -> Result<Evaluation> {
        let started = Instant::now();
        let guard = self.store.lock_evaluation(tenant_monitor).await?;

        let tm = self.store.get_tenant_monitor(tenant_monitor).await?;
        let mut monitor = self.store.get_monitor(tm.monitor).await?;
        if !tm.active {
            return Err(Error::invalid_state(format!(
                "tenant monitor {tenant_monitor} is inactive"
            )));
        }

        let query = tm.effective_query(&monitor).to_string();
        validate(&query, &self.registry)?;
        let context = self.refresh_context(&mut monitor, &query).await?;

        let build = self.build_context(tm.tenant).await?;
        let injected = inject_variables(&query, &monitor.fix_me_link, &monitor.exclude_field)?;
        let request = RunRequest::new(build, injected, context);

        let run_started = Instant::now();
        let output = self.dispatcher.run(&request, cancel).await?;
        let execution_time = run_started.elapsed().as_secs_f64();
        if cancel.is_cancelled() {
            debug!(tenant_monitor = %tm.id, "Evaluation cancelled, nothing persisted");
            return Err(Error::Cancelled);
        }

        let active = self.store.active_exclusions(tm.id).await?;
        let (data, status) = filter_and_classify(output, &active, monitor.health_condition);
        let (data, oversized) = enforce_size(data, self.config.max_result_bytes)?;
        let mut status = if oversized {
            warn!(tenant_monitor = %tm.id, "Result replaced by size marker");
            Status::ConnectionError
        } else {
            status
        };

        if matches!(status, Status::Healthy | Status::Triggered) {
            let unfiltered = build_unfiltered(&query, self.config.unfiltered_limit)?;
            let probe = self
                .dispatcher
                .run(&request.with_query(unfiltered), cancel)
                .await?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if probe.data.is_error() {
                debug!(tenant_monitor = %tm.id, "Unfiltered probe failed, keeping status");
            } else {
                status = apply_no_data(status, probe.has_rows());
            }
        }

        let last_events = ExclusionService::new(self.store.clone())
            .last_events(&active)
            .await?;
        let exclusion_events = lifecycle_events(&active, &data, &last_events);

        let record = EvaluationRecord {
            result: MonitorResult {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                tenant_monitor: tm.id,
                status,
                health_condition: monitor.health_condition,
                query,
                execution_time,
                user,
                data,
            },
            exclusion_events,
        };
        self.store.persist_evaluation(&record).await?;
        drop(guard);

        for event in &record.exclusion_events {
            record_exclusion_event(event.event_type);
        }
        self.stats.record(status, started.elapsed());
        info!(
            tenant_monitor = %tm.id,
            monitor = %monitor.id,
            tenant = %tm.tenant,
            status = %status,
            rows = record.result.data.row_count(),
            excluded = record.result.data.excluded_results.len(),
            execution_time,
            "Monitor evaluated"
        );

        let reconcile = match self.reconciler.reconcile(tm.id).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(tenant_monitor = %tm.id, error = %err, "Action item reconciliation failed");
                None
            }
        };

        Ok(Evaluation {
            result: record.result,
            exclusion_events: record.exclusion_events,
            reconcile,
        })
    }

    /// Fail with `ValidationFailure` unless the monitor's validation query
    /// returns at least one row for `tenant`
    pub async fn check_validation(
        &self,
        monitor: &Monitor,
        tenant: TenantId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(validation) = &monitor.validation_query else {
            return Ok(());
        };
        validate(validation, &self.registry)?;
        let request = RunRequest::new(
            self.build_context(tenant).await?,
            validation.clone(),
            infer_context(validation)?,
        );
        let output = self.dispatcher.run(&request, cancel).await?;
        if output.data.is_error() || !output.has_rows() {
            return Err(Error::ValidationFailure {
                tenant: tenant.to_string(),
            });
        }
        Ok(())
    }

    /// Runner context of the query about to run. Custom monitors store the
    /// context re-inferred from an edited query.
    async fn refresh_context(&self, monitor: &mut Monitor, query: &str) -> Result<QueryContext> {
        let context = infer_context(query)?;
        if monitor.is_custom() && monitor.context != context {
            debug!(
                monitor = %monitor.id,
                from = monitor.context.label(),
                to = context.label(),
                "Runner context changed"
            );
            monitor.context = context;
            monitor.updated_at = Utc::now();
            self.store.update_monitor(monitor, &[]).await?;
        }
        Ok(context)
    }

    async fn build_context(&self, tenant: TenantId) -> Result<BuildContext> {
        let types = self.store.list_object_types(tenant).await?;
        Ok(BuildContext::new(tenant).with_object_types(types))
    }
}

/// Extract placeholders, apply exclusions and classify.
///
/// Fanned-out runs are filtered and classified per source and the statuses
/// combined; each exclusion holds at most one row across all sources.
pub fn filter_and_classify(
    output: RunOutput,
    active: &[Exclusion],
    health_condition: HealthCondition,
) -> (ResultData, Status) {
    if output.partials.is_empty() {
        let mut data = output.data;
        data.extract_variables();
        filter(&mut data, active);
        let status = classify(&data, health_condition);
        return (data, status);
    }

    let mut combined = ResultData::default();
    let mut statuses = Vec::with_capacity(output.partials.len());
    for partial in output.partials {
        let mut data = partial.data;
        data.extract_variables();
        let unmatched: Vec<Exclusion> = active
            .iter()
            .filter(|e| !combined.excluded_results.contains_key(&e.id.to_string()))
            .cloned()
            .collect();
        filter(&mut data, &unmatched);
        statuses.push(classify(&data, health_condition));

        if combined.columns.is_empty() && !data.columns.is_empty() {
            combined.columns = data.columns;
        }
        if combined.error.is_none() {
            combined.error = data.error;
        }
        combined.data.extend(data.data);
        combined.variables.extend(data.variables);
        combined.excluded_results.extend(data.excluded_results);
    }
    if !combined.columns.is_empty() {
        combined.error = None;
    }
    (combined, aggregate(statuses))
}
