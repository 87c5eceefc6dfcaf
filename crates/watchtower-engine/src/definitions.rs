//! Monitor definitions and tenant bindings
//!
//! Saving a definition validates its queries and re-infers its runner
//! context. Edits that invalidate dependent state (an exclude field change,
//! a System query no longer compatible with tenant overrides, a tenant
//! monitor pointing at a different monitor) clean that state up in the same
//! write.

use crate::exclusions::deletions;
use crate::reconciler::Reconciler;
use crate::stats::record_exclusion_event;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use watchtower_core::{
    Error, ExclusionEventType, Monitor, MonitorId, MonitorKind, Result, TenantId, TenantMonitor,
    TenantMonitorId, Urgency,
};
use watchtower_query::{compatible, infer_context, placeholders, validate, Registry};
use watchtower_store::{ExclusionChange, Store};

pub struct MonitorService {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    reconciler: Arc<Reconciler>,
}

impl MonitorService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            store,
            registry,
            reconciler,
        }
    }

    /// Reject queries that would not run and derive the runner context
    fn prepare(&self, monitor: &mut Monitor) -> Result<()> {
        validate(&monitor.query, &self.registry)?;
        if let Some(validation) = &monitor.validation_query {
            validate(validation, &self.registry)?;
        }
        placeholders(&monitor.fix_me_link, &monitor.exclude_field)?;
        monitor.context = infer_context(&monitor.query)?;
        monitor.check_invariants()
    }

    pub async fn create(&self, mut monitor: Monitor) -> Result<Monitor> {
        self.prepare(&mut monitor)?;
        self.store.insert_monitor(&monitor).await?;
        info!(monitor = %monitor.id, kind = monitor.kind.as_str(), "Monitor created");
        Ok(monitor)
    }

    /// Save an edited definition.
    ///
    /// Active exclusions keyed by a field other than the new exclude field
    /// are deleted; tenant query overrides no longer compatible with an
    /// edited System query are cleared.
    pub async fn update(&self, mut monitor: Monitor) -> Result<Monitor> {
        let previous = self.store.get_monitor(monitor.id).await?;
        if previous.kind != monitor.kind {
            return Err(Error::invalid_state("the kind of a monitor cannot change"));
        }
        self.prepare(&mut monitor)?;
        monitor.updated_at = Utc::now();

        let mut changes = Vec::new();
        if previous.exclude_field != monitor.exclude_field {
            for tm in self.store.tenant_monitors_for_monitor(monitor.id).await? {
                let stale = self
                    .store
                    .active_exclusions(tm.id)
                    .await?
                    .into_iter()
                    .filter(|exclusion| exclusion.key != monitor.exclude_field);
                changes.extend(deletions(stale, "Exclude field changed", None));
            }
        }
        self.store.update_monitor(&monitor, &changes).await?;
        count_deletions(&changes);
        if !changes.is_empty() {
            info!(monitor = %monitor.id, deleted = changes.len(), "Exclusions deleted after exclude field change");
        }

        if monitor.kind == MonitorKind::System && previous.query != monitor.query {
            self.clear_incompatible_overrides(&monitor).await?;
        }
        Ok(monitor)
    }

    async fn clear_incompatible_overrides(&self, monitor: &Monitor) -> Result<usize> {
        let mut cleared = 0;
        for mut tm in self.store.tenant_monitors_for_monitor(monitor.id).await? {
            let Some(query) = &tm.query else {
                continue;
            };
            if compatible(query, &monitor.query) {
                continue;
            }
            warn!(
                tenant_monitor = %tm.id,
                monitor = %monitor.id,
                "Query override no longer compatible with monitor, clearing it"
            );
            tm.query = None;
            tm.updated_at = Utc::now();
            self.store.update_tenant_monitor(&tm, &[]).await?;
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Copy a System monitor into a Custom monitor owned by `tenant` and move
    /// the tenant's binding over to the copy
    pub async fn clone_monitor(&self, system: MonitorId, tenant: TenantId) -> Result<Monitor> {
        let parent = self.store.get_monitor(system).await?;
        if parent.kind != MonitorKind::System {
            return Err(Error::invalid_state(format!(
                "monitor {system} is not a system monitor"
            )));
        }
        let binding = self.store.find_tenant_monitor(tenant, parent.id).await?;

        let name = binding
            .as_ref()
            .and_then(|tm| tm.name.clone())
            .unwrap_or_else(|| parent.name.clone());
        let query = binding
            .as_ref()
            .and_then(|tm| tm.query.clone())
            .unwrap_or_else(|| parent.query.clone());

        let fresh = Monitor::custom(tenant, name, query);
        let mut clone = Monitor {
            id: fresh.id,
            display_id: fresh.display_id,
            name: fresh.name,
            query: fresh.query,
            kind: MonitorKind::Custom,
            owner: Some(tenant),
            parent_monitor: Some(parent.id),
            created_at: fresh.created_at,
            updated_at: fresh.updated_at,
            ..parent.clone()
        };
        if let Some(description) = binding.as_ref().and_then(|tm| tm.description.clone()) {
            clone.description = description;
        }
        let clone = self.create(clone).await?;

        if let Some(tm) = binding {
            self.repoint(tm, clone.id, "Monitor replaced by a custom copy")
                .await?;
        }
        Ok(clone)
    }

    /// Bind a tenant monitor to another definition; its active exclusions
    /// belong to the old one and are deleted
    async fn repoint(&self, mut tm: TenantMonitor, monitor: MonitorId, reason: &str) -> Result<()> {
        let changes: Vec<ExclusionChange> =
            deletions(self.store.active_exclusions(tm.id).await?, reason, None);
        tm.monitor = monitor;
        tm.name = None;
        tm.description = None;
        tm.query = None;
        tm.updated_at = Utc::now();
        self.store.update_tenant_monitor(&tm, &changes).await?;
        count_deletions(&changes);
        info!(tenant_monitor = %tm.id, monitor = %monitor, deleted = changes.len(), "Tenant monitor re-pointed");
        Ok(())
    }

    /// Bind a monitor to a tenant
    pub async fn bind(&self, tenant: TenantId, monitor: MonitorId) -> Result<TenantMonitor> {
        let definition = self.store.get_monitor(monitor).await?;
        if definition.is_custom() && definition.owner != Some(tenant) {
            return Err(Error::invalid_state(format!(
                "custom monitor {monitor} belongs to another tenant"
            )));
        }
        let tm = TenantMonitor::new(tenant, monitor);
        self.store.insert_tenant_monitor(&tm).await?;
        Ok(tm)
    }

    /// Set or clear the tenant's query override
    pub async fn set_query_override(
        &self,
        tenant_monitor: TenantMonitorId,
        query: Option<String>,
    ) -> Result<TenantMonitor> {
        let mut tm = self.store.get_tenant_monitor(tenant_monitor).await?;
        if let Some(query) = &query {
            validate(query, &self.registry)?;
        }
        tm.query = query;
        tm.updated_at = Utc::now();
        self.store.update_tenant_monitor(&tm, &[]).await?;
        Ok(tm)
    }

    /// Activate or deactivate a binding. Deactivation drops its open
    /// action items.
    pub async fn set_active(
        &self,
        tenant_monitor: TenantMonitorId,
        active: bool,
    ) -> Result<TenantMonitor> {
        let mut tm = self.store.get_tenant_monitor(tenant_monitor).await?;
        tm.active = active;
        tm.toggled_by_system = false;
        tm.updated_at = Utc::now();
        self.store.update_tenant_monitor(&tm, &[]).await?;
        self.reconcile(&tm).await;
        Ok(tm)
    }

    pub async fn set_urgency(
        &self,
        tenant_monitor: TenantMonitorId,
        urgency: Option<Urgency>,
    ) -> Result<TenantMonitor> {
        let mut tm = self.store.get_tenant_monitor(tenant_monitor).await?;
        tm.urgency = urgency;
        tm.updated_at = Utc::now();
        self.store.update_tenant_monitor(&tm, &[]).await?;
        self.reconcile(&tm).await;
        Ok(tm)
    }

    async fn reconcile(&self, tm: &TenantMonitor) {
        if let Err(err) = self.reconciler.reconcile(tm.id).await {
            warn!(tenant_monitor = %tm.id, error = %err, "Reconciliation failed");
        }
    }
}

fn count_deletions(changes: &[ExclusionChange]) {
    for _ in changes {
        record_exclusion_event(ExclusionEventType::Deleted);
    }
}
