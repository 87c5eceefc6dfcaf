//! In-memory store
//!
//! Backs the engine tests and dry runs. A single lock over all tables gives
//! every multi-row write the same all-or-nothing behaviour as a database
//! transaction.

use crate::store::{
    ActionItemStore, EvaluationGuard, EvaluationLock, EvaluationRecord, ExclusionChange,
    ExclusionStore, Liveness, MonitorStore, ResultStore, ResultUpdate, TenantStore,
    UserEventStore, WatcherStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use watchtower_core::{
    ActionItem, Error, Exclusion, ExclusionEvent, ExclusionId, Monitor, MonitorId, MonitorResult,
    ObjectType, Result, SubscriptionEvent, Tenant, TenantId, TenantMonitor, TenantMonitorId,
    User, UserId, UserMonitorEvent, WatcherList,
};

#[derive(Debug, Default)]
struct Tables {
    tenants: HashMap<TenantId, Tenant>,
    users: HashMap<UserId, User>,
    object_types: HashMap<Uuid, ObjectType>,
    monitors: HashMap<MonitorId, Monitor>,
    tenant_monitors: HashMap<TenantMonitorId, TenantMonitor>,
    /// Ordered by `created_at`
    results: HashMap<TenantMonitorId, Vec<MonitorResult>>,
    exclusions: HashMap<ExclusionId, Exclusion>,
    exclusion_events: HashMap<ExclusionId, Vec<ExclusionEvent>>,
    watchers: HashMap<TenantMonitorId, BTreeSet<UserId>>,
    subscriptions: Vec<SubscriptionEvent>,
    action_items: HashMap<Uuid, ActionItem>,
    user_events: Vec<UserMonitorEvent>,
}

impl Tables {
    fn tenant_monitor_mut(&mut self, id: TenantMonitorId) -> Result<&mut TenantMonitor> {
        self.tenant_monitors
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("tenant monitor", id))
    }

    /// Validate a batch of exclusion changes against the current rows and
    /// each other, then apply it.
    fn apply_changes(&mut self, changes: &[ExclusionChange]) -> Result<()> {
        let mut staged = self.exclusions.clone();
        for change in changes {
            let exclusion = &change.exclusion;
            if change.event.exclusion != exclusion.id {
                return Err(Error::invalid_state(format!(
                    "event {} does not belong to exclusion {}",
                    change.event.id, exclusion.id
                )));
            }
            if !self.tenant_monitors.contains_key(&exclusion.tenant_monitor) {
                return Err(Error::not_found("tenant monitor", exclusion.tenant_monitor));
            }
            if exclusion.is_active {
                let duplicate = staged.values().any(|other| {
                    other.id != exclusion.id
                        && other.is_active
                        && other.tenant_monitor == exclusion.tenant_monitor
                        && other.key == exclusion.key
                        && other.value == exclusion.value
                });
                if duplicate {
                    return Err(Error::conflict(format!(
                        "an active exclusion for {}={} already exists",
                        exclusion.key, exclusion.value
                    )));
                }
            }
            staged.insert(exclusion.id, exclusion.clone());
        }

        self.exclusions = staged;
        for change in changes {
            self.exclusion_events
                .entry(change.exclusion.id)
                .or_default()
                .push(change.event.clone());
        }
        Ok(())
    }
}

/// Store kept entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    locks: Mutex<HashMap<TenantMonitorId, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.tables.write().tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Tenant> {
        self.tables
            .read()
            .tenants
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("tenant", id))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<_> = self.tables.read().tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tenants)
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        self.tables.write().users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<User> {
        self.tables
            .read()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("user", id))
    }

    async fn list_users(&self, tenant: TenantId) -> Result<Vec<User>> {
        let mut users: Vec<_> = self
            .tables
            .read()
            .users
            .values()
            .filter(|user| user.tenant == tenant)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    async fn upsert_object_type(&self, object_type: &ObjectType) -> Result<()> {
        self.tables
            .write()
            .object_types
            .insert(object_type.id, object_type.clone());
        Ok(())
    }

    async fn list_object_types(&self, tenant: TenantId) -> Result<Vec<ObjectType>> {
        Ok(self
            .tables
            .read()
            .object_types
            .values()
            .filter(|object_type| object_type.tenant == tenant)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()> {
        monitor.check_invariants()?;
        let mut tables = self.tables.write();
        if tables.monitors.contains_key(&monitor.id) {
            return Err(Error::conflict(format!("monitor {} already exists", monitor.id)));
        }
        tables.monitors.insert(monitor.id, monitor.clone());
        Ok(())
    }

    async fn update_monitor(&self, monitor: &Monitor, changes: &[ExclusionChange]) -> Result<()> {
        monitor.check_invariants()?;
        let mut tables = self.tables.write();
        if !tables.monitors.contains_key(&monitor.id) {
            return Err(Error::not_found("monitor", monitor.id));
        }
        tables.apply_changes(changes)?;
        tables.monitors.insert(monitor.id, monitor.clone());
        Ok(())
    }

    async fn get_monitor(&self, id: MonitorId) -> Result<Monitor> {
        self.tables
            .read()
            .monitors
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("monitor", id))
    }

    async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        let mut monitors: Vec<_> = self.tables.read().monitors.values().cloned().collect();
        monitors.sort_by_key(|monitor| monitor.created_at);
        Ok(monitors)
    }

    async fn monitor_children(&self, parent: MonitorId) -> Result<Vec<Monitor>> {
        Ok(self
            .tables
            .read()
            .monitors
            .values()
            .filter(|monitor| monitor.parent_monitor == Some(parent))
            .cloned()
            .collect())
    }

    async fn insert_tenant_monitor(&self, tenant_monitor: &TenantMonitor) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.monitors.contains_key(&tenant_monitor.monitor) {
            return Err(Error::not_found("monitor", tenant_monitor.monitor));
        }
        let bound = tables.tenant_monitors.values().any(|existing| {
            existing.tenant == tenant_monitor.tenant && existing.monitor == tenant_monitor.monitor
        });
        if bound || tables.tenant_monitors.contains_key(&tenant_monitor.id) {
            return Err(Error::conflict(format!(
                "monitor {} is already bound to tenant {}",
                tenant_monitor.monitor, tenant_monitor.tenant
            )));
        }
        tables
            .tenant_monitors
            .insert(tenant_monitor.id, tenant_monitor.clone());
        Ok(())
    }

    async fn update_tenant_monitor(
        &self,
        tenant_monitor: &TenantMonitor,
        changes: &[ExclusionChange],
    ) -> Result<()> {
        let mut tables = self.tables.write();
        tables.tenant_monitor_mut(tenant_monitor.id)?;
        tables.apply_changes(changes)?;
        tables
            .tenant_monitors
            .insert(tenant_monitor.id, tenant_monitor.clone());
        Ok(())
    }

    async fn get_tenant_monitor(&self, id: TenantMonitorId) -> Result<TenantMonitor> {
        self.tables
            .read()
            .tenant_monitors
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("tenant monitor", id))
    }

    async fn find_tenant_monitor(
        &self,
        tenant: TenantId,
        monitor: MonitorId,
    ) -> Result<Option<TenantMonitor>> {
        Ok(self
            .tables
            .read()
            .tenant_monitors
            .values()
            .find(|tm| tm.tenant == tenant && tm.monitor == monitor)
            .cloned())
    }

    async fn list_tenant_monitors(&self, tenant: TenantId) -> Result<Vec<TenantMonitor>> {
        let mut bound: Vec<_> = self
            .tables
            .read()
            .tenant_monitors
            .values()
            .filter(|tm| tm.tenant == tenant)
            .cloned()
            .collect();
        bound.sort_by_key(|tm| tm.created_at);
        Ok(bound)
    }

    async fn tenant_monitors_for_monitor(&self, monitor: MonitorId) -> Result<Vec<TenantMonitor>> {
        Ok(self
            .tables
            .read()
            .tenant_monitors
            .values()
            .filter(|tm| tm.monitor == monitor)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn persist_evaluation(&self, record: &EvaluationRecord) -> Result<()> {
        let mut tables = self.tables.write();
        let result = &record.result;
        tables.tenant_monitor_mut(result.tenant_monitor)?;
        if let Some(event) = record
            .exclusion_events
            .iter()
            .find(|event| !tables.exclusions.contains_key(&event.exclusion))
        {
            return Err(Error::not_found("exclusion", event.exclusion));
        }

        let tm = tables.tenant_monitor_mut(result.tenant_monitor)?;
        tm.status = result.status;
        tm.updated_at = result.created_at;

        let log = tables.results.entry(result.tenant_monitor).or_default();
        log.push(result.clone());
        log.sort_by_key(|r| r.created_at);

        for event in &record.exclusion_events {
            tables
                .exclusion_events
                .entry(event.exclusion)
                .or_default()
                .push(event.clone());
        }
        debug!(
            tenant_monitor = %result.tenant_monitor,
            status = %result.status,
            "Persisted evaluation"
        );
        Ok(())
    }

    async fn latest_result(&self, tenant_monitor: TenantMonitorId) -> Result<Option<MonitorResult>> {
        Ok(self
            .tables
            .read()
            .results
            .get(&tenant_monitor)
            .and_then(|log| log.last())
            .cloned())
    }

    async fn results_between(
        &self,
        tenant_monitor: TenantMonitorId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MonitorResult>> {
        Ok(self
            .tables
            .read()
            .results
            .get(&tenant_monitor)
            .map(|log| {
                log.iter()
                    .filter(|r| r.created_at >= start && r.created_at <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn result_before(
        &self,
        tenant_monitor: TenantMonitorId,
        at: DateTime<Utc>,
    ) -> Result<Option<MonitorResult>> {
        Ok(self
            .tables
            .read()
            .results
            .get(&tenant_monitor)
            .and_then(|log| log.iter().rev().find(|r| r.created_at < at))
            .cloned())
    }
}

#[async_trait]
impl ExclusionStore for MemoryStore {
    async fn get_exclusion(&self, id: ExclusionId) -> Result<Exclusion> {
        self.tables
            .read()
            .exclusions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("exclusion", id))
    }

    async fn list_exclusions(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<Exclusion>> {
        let mut exclusions: Vec<_> = self
            .tables
            .read()
            .exclusions
            .values()
            .filter(|e| e.tenant_monitor == tenant_monitor)
            .cloned()
            .collect();
        exclusions.sort_by_key(|e| e.exclusion_date);
        Ok(exclusions)
    }

    async fn active_exclusions(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<Exclusion>> {
        let mut exclusions = self.list_exclusions(tenant_monitor).await?;
        exclusions.retain(|e| e.is_active);
        Ok(exclusions)
    }

    async fn exclusion_events(&self, exclusion: ExclusionId) -> Result<Vec<ExclusionEvent>> {
        let mut events = self
            .tables
            .read()
            .exclusion_events
            .get(&exclusion)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|event| event.event_date);
        Ok(events)
    }

    async fn apply_exclusion_change(
        &self,
        change: &ExclusionChange,
        result: Option<&ResultUpdate>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(update) = result {
            let known = tables
                .results
                .get(&update.tenant_monitor)
                .is_some_and(|log| log.iter().any(|r| r.id == update.result));
            if !known {
                return Err(Error::not_found("monitor result", update.result));
            }
        }

        tables.apply_changes(std::slice::from_ref(change))?;

        if let Some(update) = result {
            if let Some(stored) = tables
                .results
                .get_mut(&update.tenant_monitor)
                .and_then(|log| log.iter_mut().find(|r| r.id == update.result))
            {
                stored.status = update.status;
                stored.data = update.data.clone();
            }
            tables.tenant_monitor_mut(update.tenant_monitor)?.status = update.status;
        }
        Ok(())
    }

    async fn append_exclusion_event(&self, event: &ExclusionEvent) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.exclusions.contains_key(&event.exclusion) {
            return Err(Error::not_found("exclusion", event.exclusion));
        }
        tables
            .exclusion_events
            .entry(event.exclusion)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn purge_exclusions(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables.write();
        let stale: Vec<ExclusionId> = tables
            .exclusions
            .values()
            .filter(|exclusion| !exclusion.is_active)
            .filter(|exclusion| {
                let last = tables
                    .exclusion_events
                    .get(&exclusion.id)
                    .and_then(|events| events.iter().map(|e| e.event_date).max())
                    .unwrap_or(exclusion.exclusion_date);
                last < cutoff
            })
            .map(|exclusion| exclusion.id)
            .collect();

        for id in &stale {
            tables.exclusions.remove(id);
            tables.exclusion_events.remove(id);
        }
        Ok(stale.len())
    }
}

#[async_trait]
impl WatcherStore for MemoryStore {
    async fn watchers(&self, tenant_monitor: TenantMonitorId) -> Result<WatcherList> {
        Ok(WatcherList {
            tenant_monitor,
            users: self
                .tables
                .read()
                .watchers
                .get(&tenant_monitor)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn set_watchers(&self, list: &WatcherList) -> Result<()> {
        self.tables
            .write()
            .watchers
            .insert(list.tenant_monitor, list.users.clone());
        Ok(())
    }

    async fn add_watcher(&self, tenant_monitor: TenantMonitorId, user: UserId) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .watchers
            .entry(tenant_monitor)
            .or_default()
            .insert(user))
    }

    async fn remove_watcher(&self, tenant_monitor: TenantMonitorId, user: UserId) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .watchers
            .get_mut(&tenant_monitor)
            .is_some_and(|users| users.remove(&user)))
    }

    async fn record_subscription(&self, event: &SubscriptionEvent) -> Result<()> {
        self.tables.write().subscriptions.push(event.clone());
        Ok(())
    }

    async fn subscription_events(&self, tenant: TenantId) -> Result<Vec<SubscriptionEvent>> {
        let mut events: Vec<_> = self
            .tables
            .read()
            .subscriptions
            .iter()
            .filter(|event| event.tenant == tenant)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.at);
        Ok(events)
    }
}

#[async_trait]
impl ActionItemStore for MemoryStore {
    async fn action_items(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<ActionItem>> {
        let mut items: Vec<_> = self
            .tables
            .read()
            .action_items
            .values()
            .filter(|item| item.tenant_monitor == tenant_monitor)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn insert_action_item(&self, item: &ActionItem) -> Result<bool> {
        let mut tables = self.tables.write();
        if tables.action_items.contains_key(&item.id) {
            return Err(Error::conflict(format!("action item {} already exists", item.id)));
        }
        let duplicate = item.is_open()
            && tables.action_items.values().any(|open| {
                open.is_open()
                    && open.tenant_monitor == item.tenant_monitor
                    && open.assignee == item.assignee
            });
        if duplicate {
            return Ok(false);
        }
        tables.action_items.insert(item.id, item.clone());
        Ok(true)
    }

    async fn update_action_item(&self, item: &ActionItem) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.action_items.get_mut(&item.id) {
            Some(stored) => {
                *stored = item.clone();
                Ok(())
            }
            None => Err(Error::not_found("action item", item.id)),
        }
    }

    async fn delete_action_items(&self, ids: &[Uuid]) -> Result<usize> {
        let mut tables = self.tables.write();
        Ok(ids
            .iter()
            .filter(|id| tables.action_items.remove(id).is_some())
            .count())
    }
}

#[async_trait]
impl UserEventStore for MemoryStore {
    async fn record_user_event(&self, event: &UserMonitorEvent) -> Result<()> {
        self.tables.write().user_events.push(event.clone());
        Ok(())
    }

    async fn user_events(&self, user: UserId) -> Result<Vec<UserMonitorEvent>> {
        let mut events: Vec<_> = self
            .tables
            .read()
            .user_events
            .iter()
            .filter(|event| event.user == user)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.at);
        Ok(events)
    }
}

#[async_trait]
impl EvaluationLock for MemoryStore {
    async fn lock_evaluation(&self, tenant_monitor: TenantMonitorId) -> Result<EvaluationGuard> {
        let lock = self
            .locks
            .lock()
            .entry(tenant_monitor)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Ok(EvaluationGuard::new(lock.lock_owned().await))
    }
}

#[async_trait]
impl Liveness for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
