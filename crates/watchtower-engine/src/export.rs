//! Tabular snapshots of a tenant monitor
//!
//! A snapshot is a list of named sheets: the last result, optionally the
//! unfiltered data and the monitor's metadata, and the excluded rows.
//! Sheets render to CSV (one document each) or to a single JSON document.

use crate::exclusions::ExclusionService;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use watchtower_core::result::value_to_text;
use watchtower_core::{
    Error, ExclusionEventType, Monitor, MonitorResult, Result, ResultData, TenantMonitor,
    TenantMonitorId,
};
use watchtower_query::{build_unfiltered, infer_context, BuildContext};
use watchtower_runner::{Dispatcher, RunRequest};
use watchtower_store::Store;

pub const LAST_RESULT: &str = "Last Result";
pub const UNFILTERED_DATA: &str = "Unfiltered Data";
pub const METADATA: &str = "Metadata";
pub const EXCLUDED_RESULTS: &str = "Excluded Results";

const EXCLUDED_COLUMNS: [&str; 6] = [
    "excluded-by",
    "excluded-date",
    "last-update",
    "justification",
    "snapshot",
    "flags",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sheet {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows,
        }
    }

    /// Sheet of a stored or fresh result; failed runs show their error
    fn from_data(name: &str, data: &ResultData, limit: Option<usize>) -> Self {
        if let Some(error) = &data.error {
            return Self::new(name, vec!["error".into()], vec![vec![json!(error)]]);
        }
        let take = limit.unwrap_or(usize::MAX);
        Self::new(
            name,
            data.columns.clone(),
            data.data.iter().take(take).cloned().collect(),
        )
    }

    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns).map_err(csv_error)?;
        for row in &self.rows {
            writer
                .write_record(row.iter().map(|cell| value_to_text(cell).unwrap_or_default()))
                .map_err(csv_error)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| Error::internal(format!("csv output: {e}")))?;
        String::from_utf8(bytes).map_err(|e| Error::internal(format!("csv output: {e}")))
    }
}

fn csv_error(err: csv::Error) -> Error {
    Error::internal(format!("csv output: {err}"))
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub tenant_monitor: TenantMonitorId,
    pub generated_at: DateTime<Utc>,
    pub sheets: Vec<Sheet>,
}

impl Snapshot {
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|sheet| sheet.name == name)
    }

    /// `(sheet name, CSV document)` per sheet
    pub fn to_csv(&self) -> Result<Vec<(String, String)>> {
        self.sheets
            .iter()
            .map(|sheet| Ok((sheet.name.clone(), sheet.to_csv()?)))
            .collect()
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    pub include_unfiltered: bool,
    pub include_metadata: bool,

    /// Row cap for the result sheets
    pub limit: Option<usize>,
}

pub struct ExportService {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    unfiltered_limit: u64,
}

impl ExportService {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<Dispatcher>, unfiltered_limit: u64) -> Self {
        Self {
            store,
            dispatcher,
            unfiltered_limit,
        }
    }

    pub async fn snapshot(
        &self,
        tenant_monitor: TenantMonitorId,
        options: SnapshotOptions,
    ) -> Result<Snapshot> {
        let tm = self.store.get_tenant_monitor(tenant_monitor).await?;
        let monitor = self.store.get_monitor(tm.monitor).await?;
        let latest = self.store.latest_result(tm.id).await?;

        let mut sheets = Vec::with_capacity(4);
        let last = latest
            .as_ref()
            .map(|result| Sheet::from_data(LAST_RESULT, &result.data, options.limit))
            .unwrap_or_else(|| Sheet::new(LAST_RESULT, Vec::new(), Vec::new()));
        sheets.push(last);

        if options.include_unfiltered {
            sheets.push(self.unfiltered(&tm, &monitor, options.limit).await?);
        }
        if options.include_metadata {
            sheets.push(metadata(&tm, &monitor, latest.as_ref()));
        }
        sheets.push(self.excluded(tm.id).await?);

        debug!(tenant_monitor = %tm.id, sheets = sheets.len(), "Snapshot built");
        Ok(Snapshot {
            tenant_monitor: tm.id,
            generated_at: Utc::now(),
            sheets,
        })
    }

    async fn unfiltered(
        &self,
        tm: &TenantMonitor,
        monitor: &Monitor,
        limit: Option<usize>,
    ) -> Result<Sheet> {
        let query = tm.effective_query(monitor);
        let limit = limit.map_or(self.unfiltered_limit, |limit| limit as u64);
        let sql = build_unfiltered(query, limit)?;
        let types = self.store.list_object_types(tm.tenant).await?;
        let request = RunRequest::new(
            BuildContext::new(tm.tenant).with_object_types(types),
            sql,
            infer_context(query)?,
        );
        let output = self
            .dispatcher
            .run(&request, &CancellationToken::new())
            .await?;
        let mut data = output.data;
        data.extract_variables();
        Ok(Sheet::from_data(UNFILTERED_DATA, &data, None))
    }

    async fn excluded(&self, tenant_monitor: TenantMonitorId) -> Result<Sheet> {
        let records = ExclusionService::new(self.store.clone())
            .list(tenant_monitor)
            .await?;
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let excluded_by = match record.created_by {
                Some(user) => match self.store.get_user(user).await {
                    Ok(user) => user.email,
                    Err(_) => user.to_string(),
                },
                None => "System".to_string(),
            };
            let flags = match record.last_event() {
                Some(ExclusionEventType::Deprecated) => "deprecated",
                _ => "",
            };
            rows.push(vec![
                json!(excluded_by),
                json!(record.exclusion.exclusion_date.to_rfc3339()),
                json!(record.last_update.to_rfc3339()),
                json!(record.exclusion.justification),
                json!(record.exclusion.snapshot.to_string()),
                json!(flags),
            ]);
        }
        Ok(Sheet::new(
            EXCLUDED_RESULTS,
            EXCLUDED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        ))
    }
}

fn metadata(tm: &TenantMonitor, monitor: &Monitor, latest: Option<&MonitorResult>) -> Sheet {
    let mut fields = vec![
        ("name", json!(tm.effective_name(monitor))),
        ("display_id", json!(monitor.display_id)),
        ("description", json!(tm.effective_description(monitor))),
        ("status", json!(tm.status.as_str())),
        ("urgency", json!(tm.effective_urgency(monitor).as_str())),
        ("health_condition", json!(monitor.health_condition.as_str())),
        ("frequency", json!(monitor.frequency.as_str())),
        ("query", json!(tm.effective_query(monitor))),
        ("controls", json!(monitor.control_refs.join(", "))),
        ("tags", json!(monitor.tag_refs.join(", "))),
    ];
    if let Some(result) = latest {
        fields.push(("last_run", json!(result.created_at.to_rfc3339())));
        fields.push(("execution_time", json!(result.execution_time)));
    }
    Sheet::new(
        METADATA,
        vec!["field".into(), "value".into()],
        fields
            .into_iter()
            .map(|(field, value)| vec![json!(field), value])
            .collect(),
    )
}
