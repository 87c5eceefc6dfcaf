//! Row exclusions
//!
//! An exclusion suppresses the row whose `exclude_field` placeholder equals
//! its value. Filtering moves matching rows from `data` into
//! `excluded_results`; every state change of an exclusion is recorded as an
//! append-only event.

use crate::classifier::classify;
use crate::stats::record_exclusion_event;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use watchtower_core::{
    Error, Exclusion, ExclusionEvent, ExclusionEventType, ExclusionId, HealthCondition, Result,
    ResultData, Status, TenantMonitorId, UserId,
};
use watchtower_store::{ExclusionChange, ResultUpdate, Store};

/// Move rows matched by active exclusions into `excluded_results`.
///
/// Exclusions already present in `excluded_results` are skipped, so a second
/// pass with the same exclusions changes nothing. Returns the number of rows
/// moved.
pub fn filter(data: &mut ResultData, exclusions: &[Exclusion]) -> usize {
    let mut moved = 0;
    for exclusion in exclusions.iter().filter(|e| e.is_active) {
        let id = exclusion.id.to_string();
        if data.excluded_results.contains_key(&id) {
            continue;
        }
        let Some(index) = data.find_row(&exclusion.key, &exclusion.value) else {
            continue;
        };
        if let Some(row) = data.take_row(index) {
            data.excluded_results.insert(id, row);
            moved += 1;
        }
    }
    moved
}

/// Put the row held by an exclusion back into `data`
pub fn restore(data: &mut ResultData, exclusion: ExclusionId) -> bool {
    match data.excluded_results.remove(&exclusion.to_string()) {
        Some(row) => {
            data.push_row(row);
            true
        }
        None => false,
    }
}

/// Events implied by a filtered run.
///
/// An active exclusion that matched nothing is deprecated once; one that
/// matches again after being deprecated is renewed. Failed runs imply
/// nothing.
pub fn lifecycle_events(
    active: &[Exclusion],
    data: &ResultData,
    last_events: &HashMap<ExclusionId, ExclusionEventType>,
) -> Vec<ExclusionEvent> {
    if data.is_error() {
        return Vec::new();
    }
    let mut events = Vec::new();
    for exclusion in active.iter().filter(|e| e.is_active) {
        let matched = data.excluded_results.contains_key(&exclusion.id.to_string());
        let deprecated = last_events.get(&exclusion.id) == Some(&ExclusionEventType::Deprecated);
        let event_type = match (matched, deprecated) {
            (false, false) => ExclusionEventType::Deprecated,
            (true, true) => ExclusionEventType::Renewed,
            _ => continue,
        };
        events.push(ExclusionEvent::new(
            exclusion.id,
            event_type,
            exclusion.justification.clone(),
            None,
        ));
    }
    events
}

/// Deactivate exclusions with a `Deleted` event each
pub fn deletions(
    exclusions: impl IntoIterator<Item = Exclusion>,
    justification: &str,
    user: Option<UserId>,
) -> Vec<ExclusionChange> {
    exclusions
        .into_iter()
        .filter(|exclusion| exclusion.is_active)
        .map(|mut exclusion| {
            exclusion.is_active = false;
            let event = ExclusionEvent::new(
                exclusion.id,
                ExclusionEventType::Deleted,
                justification,
                user,
            );
            ExclusionChange { exclusion, event }
        })
        .collect()
}

/// Newest first; values compared as integers when every value is numeric
pub fn sort_for_display(exclusions: &mut [Exclusion]) {
    let numeric = exclusions.iter().all(|e| e.value.trim().parse::<i64>().is_ok());
    exclusions.sort_by(|a, b| {
        b.exclusion_date
            .cmp(&a.exclusion_date)
            .then_with(|| compare_values(&a.value, &b.value, numeric))
    });
}

fn compare_values(a: &str, b: &str, numeric: bool) -> Ordering {
    if numeric {
        if let (Ok(x), Ok(y)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
            return x.cmp(&y);
        }
    }
    a.cmp(b)
}

/// Status of a stored result after its exclusions changed
fn reclassify(previous: Status, data: &ResultData, health_condition: HealthCondition) -> Status {
    match previous {
        Status::NoDataDetected | Status::ConnectionError => previous,
        _ => classify(data, health_condition),
    }
}

/// An exclusion with the facts the UI and exports show about it
#[derive(Debug, Clone, Serialize)]
pub struct ExclusionRecord {
    pub exclusion: Exclusion,
    pub created_by: Option<UserId>,
    pub last_update: DateTime<Utc>,
    pub events: Vec<ExclusionEvent>,
}

impl ExclusionRecord {
    pub fn last_event(&self) -> Option<ExclusionEventType> {
        self.events.last().map(|event| event.event_type)
    }
}

/// User-facing exclusion operations
pub struct ExclusionService {
    store: Arc<dyn Store>,
}

impl ExclusionService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Exclude the row whose exclude field equals `value`.
    ///
    /// The row moves into `excluded_results` of the latest result and that
    /// result is classified again.
    pub async fn create(
        &self,
        tenant_monitor: TenantMonitorId,
        value: &str,
        justification: &str,
        user: Option<UserId>,
    ) -> Result<Exclusion> {
        let tm = self.store.get_tenant_monitor(tenant_monitor).await?;
        let monitor = self.store.get_monitor(tm.monitor).await?;
        if monitor.exclude_field.is_empty() {
            return Err(Error::invalid_state(format!(
                "monitor {} has no exclude field",
                monitor.id
            )));
        }

        let mut exclusion = Exclusion {
            id: Uuid::new_v4(),
            tenant_monitor,
            exclusion_date: Utc::now(),
            is_active: true,
            key: monitor.exclude_field.clone(),
            value: value.to_string(),
            justification: justification.to_string(),
            snapshot: Value::Null,
        };

        let update = match self.store.latest_result(tenant_monitor).await? {
            Some(mut result) => match result.data.find_row(&exclusion.key, value) {
                Some(index) => {
                    exclusion.snapshot = result.data.row_object(&result.data.data[index]);
                    filter(&mut result.data, std::slice::from_ref(&exclusion));
                    Some(ResultUpdate {
                        result: result.id,
                        tenant_monitor,
                        status: reclassify(result.status, &result.data, result.health_condition),
                        data: result.data,
                    })
                }
                None => None,
            },
            None => None,
        };

        let change = ExclusionChange {
            event: ExclusionEvent::new(
                exclusion.id,
                ExclusionEventType::Created,
                justification,
                user,
            ),
            exclusion,
        };
        self.store
            .apply_exclusion_change(&change, update.as_ref())
            .await?;
        record_exclusion_event(ExclusionEventType::Created);
        info!(
            tenant_monitor = %tenant_monitor,
            exclusion = %change.exclusion.id,
            key = %change.exclusion.key,
            "Exclusion created"
        );
        Ok(change.exclusion)
    }

    /// Deactivate an exclusion and put its row back into the latest result
    pub async fn revert(
        &self,
        exclusion: ExclusionId,
        justification: &str,
        user: Option<UserId>,
    ) -> Result<Exclusion> {
        let mut exclusion = self.store.get_exclusion(exclusion).await?;
        if !exclusion.is_active {
            return Err(Error::invalid_state(format!(
                "exclusion {} is not active",
                exclusion.id
            )));
        }
        exclusion.is_active = false;

        let update = match self.store.latest_result(exclusion.tenant_monitor).await? {
            Some(mut result) => {
                if restore(&mut result.data, exclusion.id) {
                    Some(ResultUpdate {
                        result: result.id,
                        tenant_monitor: exclusion.tenant_monitor,
                        status: reclassify(result.status, &result.data, result.health_condition),
                        data: result.data,
                    })
                } else {
                    None
                }
            }
            None => None,
        };

        let change = ExclusionChange {
            event: ExclusionEvent::new(
                exclusion.id,
                ExclusionEventType::Deleted,
                justification,
                user,
            ),
            exclusion,
        };
        self.store
            .apply_exclusion_change(&change, update.as_ref())
            .await?;
        record_exclusion_event(ExclusionEventType::Deleted);
        info!(exclusion = %change.exclusion.id, "Exclusion reverted");
        Ok(change.exclusion)
    }

    pub async fn update_justification(
        &self,
        exclusion: ExclusionId,
        justification: &str,
        user: Option<UserId>,
    ) -> Result<Exclusion> {
        let mut exclusion = self.store.get_exclusion(exclusion).await?;
        exclusion.justification = justification.to_string();
        let change = ExclusionChange {
            event: ExclusionEvent::new(
                exclusion.id,
                ExclusionEventType::UpdatedJustification,
                justification,
                user,
            ),
            exclusion,
        };
        self.store.apply_exclusion_change(&change, None).await?;
        record_exclusion_event(ExclusionEventType::UpdatedJustification);
        Ok(change.exclusion)
    }

    /// Active exclusions of a tenant monitor with their history, in display
    /// order
    pub async fn list(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<ExclusionRecord>> {
        let mut exclusions = self.store.active_exclusions(tenant_monitor).await?;
        sort_for_display(&mut exclusions);

        let mut records = Vec::with_capacity(exclusions.len());
        for exclusion in exclusions {
            let events = self.store.exclusion_events(exclusion.id).await?;
            let created_by = events
                .iter()
                .find(|event| event.event_type == ExclusionEventType::Created)
                .and_then(|event| event.user);
            let last_update = events
                .last()
                .map(|event| event.event_date)
                .unwrap_or(exclusion.exclusion_date);
            records.push(ExclusionRecord {
                exclusion,
                created_by,
                last_update,
                events,
            });
        }
        Ok(records)
    }

    /// Last event type of every active exclusion
    pub async fn last_events(
        &self,
        active: &[Exclusion],
    ) -> Result<HashMap<ExclusionId, ExclusionEventType>> {
        let mut last = HashMap::with_capacity(active.len());
        for exclusion in active {
            if let Some(event) = self.store.exclusion_events(exclusion.id).await?.last() {
                last.insert(exclusion.id, event.event_type);
            }
        }
        Ok(last)
    }

    /// Physically remove inactive exclusions idle for longer than `retention`
    pub async fn sweep(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now() - retention;
        let removed = self.store.purge_exclusions(cutoff).await?;
        debug!(removed, cutoff = %cutoff, "Exclusion sweep finished");
        Ok(removed)
    }
}
