//! Core types for Watchtower

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::result::ResultData;

pub type TenantId = Uuid;
pub type UserId = Uuid;
pub type MonitorId = Uuid;
pub type TenantMonitorId = Uuid;
pub type ExclusionId = Uuid;

/// Classification of a single monitor run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Triggered,
    NoDataDetected,
    ConnectionError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Triggered => "triggered",
            Self::NoDataDetected => "no_data_detected",
            Self::ConnectionError => "connection_error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "triggered" => Ok(Self::Triggered),
            "no_data_detected" => Ok(Self::NoDataDetected),
            "connection_error" => Ok(Self::ConnectionError),
            other => Err(crate::Error::invalid_state(format!("unknown status {other}"))),
        }
    }
}

/// Which outcome of the query counts as healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCondition {
    /// Healthy while the query returns at least one row
    ReturnResults,
    /// Healthy while the query returns nothing
    EmptyResults,
}

impl HealthCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReturnResults => "return_results",
            Self::EmptyResults => "empty_results",
        }
    }
}

impl FromStr for HealthCondition {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "return_results" => Ok(Self::ReturnResults),
            "empty_results" => Ok(Self::EmptyResults),
            other => Err(crate::Error::invalid_state(format!(
                "unknown health condition {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Urgent,
    Standard,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Standard => "standard",
            Self::Low => "low",
        }
    }
}

impl FromStr for Urgency {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "standard" => Ok(Self::Standard),
            "low" => Ok(Self::Low),
            other => Err(crate::Error::invalid_state(format!("unknown urgency {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[default]
    Daily,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// Global definition shared by every tenant
    System,
    /// Definition owned by exactly one tenant
    Custom,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Custom => "custom",
        }
    }
}

/// Cloud vendors reachable through the cloud-query gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudVendor {
    Aws,
    Gcp,
    /// Covers both `azure_*` and `azuread_*` tables
    Azure,
    Heroku,
    Okta,
    #[serde(rename = "digitalocean")]
    DigitalOcean,
}

impl CloudVendor {
    pub const ALL: [CloudVendor; 6] = [
        Self::Aws,
        Self::Gcp,
        Self::Azure,
        Self::Heroku,
        Self::Okta,
        Self::DigitalOcean,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Heroku => "heroku",
            Self::Okta => "okta",
            Self::DigitalOcean => "digitalocean",
        }
    }

    /// Resolve a table prefix; `azuread` normalises to `azure`.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "aws" => Some(Self::Aws),
            "gcp" => Some(Self::Gcp),
            "azure" | "azuread" => Some(Self::Azure),
            "heroku" => Some(Self::Heroku),
            "okta" => Some(Self::Okta),
            "digitalocean" => Some(Self::DigitalOcean),
            _ => None,
        }
    }
}

impl fmt::Display for CloudVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudVendor {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_prefix(s)
            .ok_or_else(|| crate::Error::invalid_state(format!("unknown cloud vendor {s}")))
    }
}

/// Backend a query has to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "vendor", rename_all = "snake_case")]
pub enum QueryContext {
    #[default]
    Internal,
    Cloud(CloudVendor),
}

impl QueryContext {
    pub fn vendor(&self) -> Option<CloudVendor> {
        match self {
            Self::Internal => None,
            Self::Cloud(vendor) => Some(*vendor),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Cloud(vendor) => vendor.as_str(),
        }
    }
}

/// A tenant (organization) of the compliance application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub active: bool,
}

impl Tenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            active: true,
        }
    }
}

/// A member of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant: TenantId,
    pub email: String,
    pub role: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl User {
    pub fn new(tenant: TenantId, email: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant,
            email: email.into(),
            role: role.into(),
            active: true,
        }
    }
}

/// A monitor definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: MonitorId,
    pub name: String,
    pub display_id: String,
    #[serde(default)]
    pub description: String,

    /// The canonical SELECT
    pub query: String,

    /// Non-empty result is a prerequisite for running on a tenant
    #[serde(default)]
    pub validation_query: Option<String>,

    pub health_condition: HealthCondition,
    pub urgency: Urgency,
    #[serde(default)]
    pub frequency: Frequency,
    pub kind: MonitorKind,

    /// Set iff `kind == Custom`
    #[serde(default)]
    pub owner: Option<TenantId>,

    /// Clone provenance, only for custom monitors
    #[serde(default)]
    pub parent_monitor: Option<MonitorId>,

    /// URL template with `$table.column` placeholders
    #[serde(default)]
    pub fix_me_link: String,

    /// `table.column` reference keying row exclusions, or empty
    #[serde(default)]
    pub exclude_field: String,

    #[serde(default)]
    pub control_refs: Vec<String>,
    #[serde(default)]
    pub tag_refs: Vec<String>,
    #[serde(default)]
    pub subtask_refs: Vec<String>,
    #[serde(default)]
    pub source_systems: BTreeSet<String>,

    #[serde(default)]
    pub context: QueryContext,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Monitor {
    /// Create a system monitor with default policy settings
    pub fn system(name: impl Into<String>, query: impl Into<String>) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            name: name.into(),
            display_id: format!("MON-{}", &id.simple().to_string()[..8]),
            description: String::new(),
            query: query.into(),
            validation_query: None,
            health_condition: HealthCondition::EmptyResults,
            urgency: Urgency::Standard,
            frequency: Frequency::Daily,
            kind: MonitorKind::System,
            owner: None,
            parent_monitor: None,
            fix_me_link: String::new(),
            exclude_field: String::new(),
            control_refs: Vec::new(),
            tag_refs: Vec::new(),
            subtask_refs: Vec::new(),
            source_systems: BTreeSet::new(),
            context: QueryContext::Internal,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a custom monitor owned by `tenant`
    pub fn custom(tenant: TenantId, name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            kind: MonitorKind::Custom,
            owner: Some(tenant),
            ..Self::system(name, query)
        }
    }

    pub fn with_health_condition(mut self, health_condition: HealthCondition) -> Self {
        self.health_condition = health_condition;
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_exclude_field(mut self, exclude_field: impl Into<String>) -> Self {
        self.exclude_field = exclude_field.into();
        self
    }

    pub fn with_fix_me_link(mut self, fix_me_link: impl Into<String>) -> Self {
        self.fix_me_link = fix_me_link.into();
        self
    }

    pub fn with_validation_query(mut self, validation_query: impl Into<String>) -> Self {
        self.validation_query = Some(validation_query.into());
        self
    }

    /// Check the ownership invariants of the definition
    pub fn check_invariants(&self) -> crate::Result<()> {
        match self.kind {
            MonitorKind::Custom if self.owner.is_none() => Err(crate::Error::invalid_state(
                "custom monitors must have an owner tenant",
            )),
            MonitorKind::System if self.owner.is_some() || self.parent_monitor.is_some() => {
                Err(crate::Error::invalid_state(
                    "system monitors cannot have an owner tenant or a parent monitor",
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn is_custom(&self) -> bool {
        self.kind == MonitorKind::Custom
    }
}

/// Binding of a monitor definition to a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantMonitor {
    pub id: TenantMonitorId,
    pub tenant: TenantId,
    pub monitor: MonitorId,
    pub active: bool,
    #[serde(default)]
    pub toggled_by_system: bool,

    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub query: Option<String>,

    pub status: Status,

    /// Overrides the monitor's urgency when set
    #[serde(default)]
    pub urgency: Option<Urgency>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantMonitor {
    pub fn new(tenant: TenantId, monitor: MonitorId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant,
            monitor,
            active: true,
            toggled_by_system: false,
            name: None,
            description: None,
            query: None,
            status: Status::Healthy,
            urgency: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn effective_query<'a>(&'a self, monitor: &'a Monitor) -> &'a str {
        self.query.as_deref().unwrap_or(&monitor.query)
    }

    pub fn effective_name<'a>(&'a self, monitor: &'a Monitor) -> &'a str {
        self.name.as_deref().unwrap_or(&monitor.name)
    }

    pub fn effective_description<'a>(&'a self, monitor: &'a Monitor) -> &'a str {
        self.description.as_deref().unwrap_or(&monitor.description)
    }

    pub fn effective_urgency(&self, monitor: &Monitor) -> Urgency {
        self.urgency.unwrap_or(monitor.urgency)
    }
}

/// One persisted evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorResult {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub tenant_monitor: TenantMonitorId,
    pub status: Status,
    pub health_condition: HealthCondition,
    pub query: String,
    /// Wall-clock seconds spent running the query
    pub execution_time: f64,
    #[serde(default)]
    pub user: Option<UserId>,
    pub data: ResultData,
}

/// A persistent decision to suppress one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub id: ExclusionId,
    pub tenant_monitor: TenantMonitorId,
    pub exclusion_date: DateTime<Utc>,
    pub is_active: bool,
    pub key: String,
    pub value: String,
    pub justification: String,
    /// Row as it looked when the exclusion was created
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionEventType {
    Created,
    Deleted,
    Renewed,
    Deprecated,
    UpdatedJustification,
}

impl ExclusionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::Renewed => "renewed",
            Self::Deprecated => "deprecated",
            Self::UpdatedJustification => "updated_justification",
        }
    }
}

impl FromStr for ExclusionEventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "deleted" => Ok(Self::Deleted),
            "renewed" => Ok(Self::Renewed),
            "deprecated" => Ok(Self::Deprecated),
            "updated_justification" => Ok(Self::UpdatedJustification),
            other => Err(crate::Error::invalid_state(format!(
                "unknown exclusion event {other}"
            ))),
        }
    }
}

/// Append-only history entry of an exclusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionEvent {
    pub id: Uuid,
    pub exclusion: ExclusionId,
    pub event_date: DateTime<Utc>,
    pub event_type: ExclusionEventType,
    pub justification: String,
    #[serde(default)]
    pub user: Option<UserId>,
}

impl ExclusionEvent {
    pub fn new(
        exclusion: ExclusionId,
        event_type: ExclusionEventType,
        justification: impl Into<String>,
        user: Option<UserId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            exclusion,
            event_date: Utc::now(),
            event_type,
            justification: justification.into(),
            user,
        }
    }
}

/// Users who receive action items for a tenant monitor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatcherList {
    pub tenant_monitor: TenantMonitorId,
    pub users: BTreeSet<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Subscribed,
    Unsubscribed,
}

/// Explicit opt-in/opt-out of a user for every monitor of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub tenant: TenantId,
    pub user: UserId,
    pub event: SubscriptionKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionItemStatus {
    NotStarted,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: Uuid,
    pub assignee: UserId,
    pub tenant_monitor: TenantMonitorId,
    pub status: ActionItemStatus,
    pub due_date: DateTime<Utc>,
    pub description: String,
    pub reference_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActionItem {
    pub fn is_open(&self) -> bool {
        self.status == ActionItemStatus::NotStarted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMonitorEventKind {
    ViewDetail,
    ViewDashboard,
    CloseDynamicBanner,
}

/// UI breadcrumb used for "new" badges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMonitorEvent {
    pub user: UserId,
    #[serde(default)]
    pub tenant_monitor: Option<TenantMonitorId>,
    pub event: UserMonitorEventKind,
    pub at: DateTime<Utc>,
}

/// A typed object type registered by a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    pub id: Uuid,
    pub tenant: TenantId,
    pub type_name: String,
}

fn default_true() -> bool {
    true
}
