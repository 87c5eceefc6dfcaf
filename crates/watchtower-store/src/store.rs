//! Store traits
//!
//! The engine talks to persistence only through these traits. Each write
//! that must be atomic with its trigger (a result and its exclusion events,
//! an exclusion flip and its event) is a single method.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use uuid::Uuid;
use watchtower_core::{
    ActionItem, Exclusion, ExclusionEvent, ExclusionId, Monitor, MonitorId, MonitorResult,
    ObjectType, Result, ResultData, Status, SubscriptionEvent, Tenant, TenantId, TenantMonitor,
    TenantMonitorId, User, UserId, UserMonitorEvent, WatcherList,
};

/// Rewrite of a stored result after its exclusions changed
#[derive(Debug, Clone, PartialEq)]
pub struct ResultUpdate {
    pub result: Uuid,
    pub tenant_monitor: TenantMonitorId,
    pub status: Status,
    pub data: ResultData,
}

/// An exclusion row to insert or update, with the event recording why
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionChange {
    pub exclusion: Exclusion,
    pub event: ExclusionEvent,
}

/// Everything one evaluation writes, committed together
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub result: MonitorResult,
    pub exclusion_events: Vec<ExclusionEvent>,
}

/// Held for the duration of one tenant-monitor evaluation
pub struct EvaluationGuard {
    _inner: Box<dyn Any + Send>,
}

impl EvaluationGuard {
    pub fn new<T: Any + Send>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for EvaluationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EvaluationGuard")
    }
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<()>;
    async fn get_tenant(&self, id: TenantId) -> Result<Tenant>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    async fn upsert_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, id: UserId) -> Result<User>;
    async fn list_users(&self, tenant: TenantId) -> Result<Vec<User>>;

    async fn upsert_object_type(&self, object_type: &ObjectType) -> Result<()>;
    async fn list_object_types(&self, tenant: TenantId) -> Result<Vec<ObjectType>>;
}

/// Monitor definitions and their tenant bindings
#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()>;

    /// Update a definition and apply the exclusion changes it implies
    async fn update_monitor(&self, monitor: &Monitor, changes: &[ExclusionChange]) -> Result<()>;

    async fn get_monitor(&self, id: MonitorId) -> Result<Monitor>;
    async fn list_monitors(&self) -> Result<Vec<Monitor>>;

    /// Custom monitors cloned from `parent`
    async fn monitor_children(&self, parent: MonitorId) -> Result<Vec<Monitor>>;

    /// Fails with `Conflict` when `(tenant, monitor)` is already bound
    async fn insert_tenant_monitor(&self, tenant_monitor: &TenantMonitor) -> Result<()>;

    async fn update_tenant_monitor(
        &self,
        tenant_monitor: &TenantMonitor,
        changes: &[ExclusionChange],
    ) -> Result<()>;

    async fn get_tenant_monitor(&self, id: TenantMonitorId) -> Result<TenantMonitor>;
    async fn find_tenant_monitor(
        &self,
        tenant: TenantId,
        monitor: MonitorId,
    ) -> Result<Option<TenantMonitor>>;
    async fn list_tenant_monitors(&self, tenant: TenantId) -> Result<Vec<TenantMonitor>>;
    async fn tenant_monitors_for_monitor(&self, monitor: MonitorId) -> Result<Vec<TenantMonitor>>;
}

/// The append-only result log
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert the result, set the tenant monitor's status and append the
    /// exclusion events in one transaction
    async fn persist_evaluation(&self, record: &EvaluationRecord) -> Result<()>;

    async fn latest_result(&self, tenant_monitor: TenantMonitorId) -> Result<Option<MonitorResult>>;

    /// Results with `start <= created_at <= end`, oldest first
    async fn results_between(
        &self,
        tenant_monitor: TenantMonitorId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MonitorResult>>;

    /// Most recent result strictly before `at`
    async fn result_before(
        &self,
        tenant_monitor: TenantMonitorId,
        at: DateTime<Utc>,
    ) -> Result<Option<MonitorResult>>;
}

#[async_trait]
pub trait ExclusionStore: Send + Sync {
    async fn get_exclusion(&self, id: ExclusionId) -> Result<Exclusion>;
    async fn list_exclusions(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<Exclusion>>;
    async fn active_exclusions(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<Exclusion>>;

    /// Events of one exclusion, oldest first
    async fn exclusion_events(&self, exclusion: ExclusionId) -> Result<Vec<ExclusionEvent>>;

    /// Upsert the exclusion, append its event and optionally rewrite the
    /// stored result, atomically. Activating a second exclusion for the same
    /// `(tenant_monitor, key, value)` fails with `Conflict`.
    async fn apply_exclusion_change(
        &self,
        change: &ExclusionChange,
        result: Option<&ResultUpdate>,
    ) -> Result<()>;

    async fn append_exclusion_event(&self, event: &ExclusionEvent) -> Result<()>;

    /// Remove inactive exclusions whose last event is before `cutoff`,
    /// together with their events
    async fn purge_exclusions(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait WatcherStore: Send + Sync {
    async fn watchers(&self, tenant_monitor: TenantMonitorId) -> Result<WatcherList>;
    async fn set_watchers(&self, list: &WatcherList) -> Result<()>;

    /// Whether the user was added
    async fn add_watcher(&self, tenant_monitor: TenantMonitorId, user: UserId) -> Result<bool>;

    /// Whether the user was removed
    async fn remove_watcher(&self, tenant_monitor: TenantMonitorId, user: UserId) -> Result<bool>;

    async fn record_subscription(&self, event: &SubscriptionEvent) -> Result<()>;

    /// Subscription events of a tenant, oldest first
    async fn subscription_events(&self, tenant: TenantId) -> Result<Vec<SubscriptionEvent>>;
}

#[async_trait]
pub trait ActionItemStore: Send + Sync {
    async fn action_items(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<ActionItem>>;
    /// Insert an item; `false` when the assignee already has an open item
    /// for the tenant monitor
    async fn insert_action_item(&self, item: &ActionItem) -> Result<bool>;
    async fn update_action_item(&self, item: &ActionItem) -> Result<()>;
    async fn delete_action_items(&self, ids: &[Uuid]) -> Result<usize>;
}

#[async_trait]
pub trait UserEventStore: Send + Sync {
    async fn record_user_event(&self, event: &UserMonitorEvent) -> Result<()>;

    /// Events of one user, oldest first
    async fn user_events(&self, user: UserId) -> Result<Vec<UserMonitorEvent>>;
}

/// Serialises evaluations of the same tenant monitor across workers
#[async_trait]
pub trait EvaluationLock: Send + Sync {
    async fn lock_evaluation(&self, tenant_monitor: TenantMonitorId) -> Result<EvaluationGuard>;
}

/// Connection check run before a worker picks up a task
#[async_trait]
pub trait Liveness: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

/// Everything the engine needs from persistence
pub trait Store:
    TenantStore
    + MonitorStore
    + ResultStore
    + ExclusionStore
    + WatcherStore
    + ActionItemStore
    + UserEventStore
    + EvaluationLock
    + Liveness
{
}

impl<T> Store for T where
    T: TenantStore
        + MonitorStore
        + ResultStore
        + ExclusionStore
        + WatcherStore
        + ActionItemStore
        + UserEventStore
        + EvaluationLock
        + Liveness
{
}
