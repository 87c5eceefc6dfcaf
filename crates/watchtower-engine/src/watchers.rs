//! Watcher lists
//!
//! Default watchers of a tenant monitor are the tenant's users holding a
//! default watcher role plus explicit subscribers, minus explicit
//! unsubscribers. The latest subscription event of a user wins.

use crate::reconciler::Reconciler;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use watchtower_core::{
    Error, Result, SubscriptionEvent, SubscriptionKind, TenantId, TenantMonitor, TenantMonitorId,
    UserId, WatcherList,
};
use watchtower_store::Store;

pub struct WatcherManager {
    store: Arc<dyn Store>,
    reconciler: Arc<Reconciler>,
    default_roles: BTreeSet<String>,
}

impl WatcherManager {
    pub fn new(
        store: Arc<dyn Store>,
        reconciler: Arc<Reconciler>,
        default_roles: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            reconciler,
            default_roles: default_roles.into_iter().collect(),
        }
    }

    pub fn is_default_role(&self, role: &str) -> bool {
        self.default_roles.contains(role)
    }

    async fn subscriptions(&self, tenant: TenantId) -> Result<HashMap<UserId, SubscriptionKind>> {
        let mut latest = HashMap::new();
        for event in self.store.subscription_events(tenant).await? {
            latest.insert(event.user, event.event);
        }
        Ok(latest)
    }

    /// `(default roles ∪ subscribed) − unsubscribed` among active users
    pub async fn default_watchers(&self, tenant: TenantId) -> Result<BTreeSet<UserId>> {
        let subscriptions = self.subscriptions(tenant).await?;
        let users = self.store.list_users(tenant).await?;
        Ok(users
            .into_iter()
            .filter(|user| user.active)
            .filter(|user| match subscriptions.get(&user.id) {
                Some(SubscriptionKind::Subscribed) => true,
                Some(SubscriptionKind::Unsubscribed) => false,
                None => self.is_default_role(&user.role),
            })
            .map(|user| user.id)
            .collect())
    }

    /// Give a new tenant monitor its default watchers
    pub async fn initialize(&self, tenant_monitor: &TenantMonitor) -> Result<WatcherList> {
        let list = WatcherList {
            tenant_monitor: tenant_monitor.id,
            users: self.default_watchers(tenant_monitor.tenant).await?,
        };
        self.store.set_watchers(&list).await?;
        debug!(tenant_monitor = %tenant_monitor.id, watchers = list.users.len(), "Watchers initialised");
        self.reconcile_all(&[tenant_monitor.id]).await;
        Ok(list)
    }

    /// Opt a user in to every monitor of the tenant
    pub async fn subscribe(&self, tenant: TenantId, user: UserId) -> Result<usize> {
        self.record(tenant, user, SubscriptionKind::Subscribed).await?;
        self.apply_everywhere(tenant, user, true).await
    }

    /// Opt a user out of every monitor of the tenant
    pub async fn unsubscribe(&self, tenant: TenantId, user: UserId) -> Result<usize> {
        self.record(tenant, user, SubscriptionKind::Unsubscribed).await?;
        self.apply_everywhere(tenant, user, false).await
    }

    pub async fn add_watcher(&self, tenant_monitor: TenantMonitorId, user: UserId) -> Result<bool> {
        let added = self.store.add_watcher(tenant_monitor, user).await?;
        if added {
            self.reconcile_all(&[tenant_monitor]).await;
        }
        Ok(added)
    }

    pub async fn remove_watcher(
        &self,
        tenant_monitor: TenantMonitorId,
        user: UserId,
    ) -> Result<bool> {
        let removed = self.store.remove_watcher(tenant_monitor, user).await?;
        if removed {
            self.reconcile_all(&[tenant_monitor]).await;
        }
        Ok(removed)
    }

    /// Follow a role change of `user` (already stored with the new role)
    /// across the tenant's watcher lists. Explicit subscriptions take
    /// precedence over roles. Returns the number of lists changed.
    pub async fn on_role_changed(&self, user: UserId, previous_role: &str) -> Result<usize> {
        let user = self.store.get_user(user).await?;
        let was_default = self.is_default_role(previous_role);
        let is_default = self.is_default_role(&user.role);
        if was_default == is_default {
            return Ok(0);
        }
        if self.subscriptions(user.tenant).await?.contains_key(&user.id) {
            return Ok(0);
        }
        self.apply_everywhere(user.tenant, user.id, is_default).await
    }

    async fn record(&self, tenant: TenantId, user: UserId, event: SubscriptionKind) -> Result<()> {
        let member = self.store.get_user(user).await?;
        if member.tenant != tenant {
            return Err(Error::invalid_state(format!(
                "user {user} does not belong to tenant {tenant}"
            )));
        }
        self.store
            .record_subscription(&SubscriptionEvent {
                tenant,
                user,
                event,
                at: Utc::now(),
            })
            .await
    }

    async fn apply_everywhere(&self, tenant: TenantId, user: UserId, add: bool) -> Result<usize> {
        let mut changed = Vec::new();
        for tm in self.store.list_tenant_monitors(tenant).await? {
            let touched = if add {
                self.store.add_watcher(tm.id, user).await?
            } else {
                self.store.remove_watcher(tm.id, user).await?
            };
            if touched {
                changed.push(tm.id);
            }
        }
        self.reconcile_all(&changed).await;
        Ok(changed.len())
    }

    /// Reconciliation after a watcher change never fails the change itself
    async fn reconcile_all(&self, tenant_monitors: &[TenantMonitorId]) {
        for id in tenant_monitors {
            if let Err(err) = self.reconciler.reconcile(*id).await {
                warn!(tenant_monitor = %id, error = %err, "Reconciliation after watcher change failed");
            }
        }
    }
}
