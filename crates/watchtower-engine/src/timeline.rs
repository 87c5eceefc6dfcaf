//! Status history of one tenant monitor as contiguous intervals

use chrono::{DateTime, Utc};
use serde::Serialize;
use watchtower_core::{Error, HealthCondition, MonitorResult, Result, Status, TenantMonitorId};
use watchtower_store::Store;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: Status,
    pub query: String,
    pub health_condition: Option<HealthCondition>,
}

/// One classified run
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub at: DateTime<Utc>,
    pub status: Status,
    pub query: String,
    pub health_condition: HealthCondition,
}

impl From<&MonitorResult> for TimelineEvent {
    fn from(result: &MonitorResult) -> Self {
        Self {
            at: result.created_at,
            status: result.status,
            query: result.query.clone(),
            health_condition: result.health_condition,
        }
    }
}

/// Fold runs into intervals covering `[start, end]`.
///
/// The window starts as one `no_data_detected` interval. A run splits the
/// interval containing it unless it repeats that interval's status and
/// query. Runs before `start` set the first interval; runs after `end` are
/// an error.
pub fn build(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &[TimelineEvent],
) -> Result<Vec<Interval>> {
    if end < start {
        return Err(Error::Timeline(format!(
            "window end {end} is before its start {start}"
        )));
    }

    let mut ordered: Vec<&TimelineEvent> = events.iter().collect();
    ordered.sort_by_key(|event| event.at);

    let mut intervals = vec![Interval {
        start,
        end,
        status: Status::NoDataDetected,
        query: String::new(),
        health_condition: None,
    }];

    for event in ordered {
        if event.at > end {
            return Err(Error::Timeline(format!(
                "run at {} is after the window end {end}",
                event.at
            )));
        }
        if event.at < start {
            overwrite(&mut intervals[0], event);
            continue;
        }

        let index = intervals
            .iter()
            .rposition(|interval| interval.start <= event.at)
            .unwrap_or(0);
        let current = &mut intervals[index];
        if current.status == event.status && current.query == event.query {
            continue;
        }
        if current.start == event.at {
            overwrite(current, event);
            continue;
        }

        let tail = Interval {
            start: event.at,
            end: current.end,
            status: event.status,
            query: event.query.clone(),
            health_condition: Some(event.health_condition),
        };
        current.end = event.at;
        intervals.insert(index + 1, tail);
    }
    Ok(intervals)
}

fn overwrite(interval: &mut Interval, event: &TimelineEvent) {
    interval.status = event.status;
    interval.query = event.query.clone();
    interval.health_condition = Some(event.health_condition);
}

/// Timeline of a tenant monitor from its stored results; the last run before
/// the window decides how the window opens
pub async fn load(
    store: &dyn Store,
    tenant_monitor: TenantMonitorId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Interval>> {
    let mut events = Vec::new();
    if let Some(previous) = store.result_before(tenant_monitor, start).await? {
        events.push(TimelineEvent::from(&previous));
    }
    events.extend(
        store
            .results_between(tenant_monitor, start, end)
            .await?
            .iter()
            .map(TimelineEvent::from),
    );
    build(start, end, &events)
}
