//! Change signals to monitor selection

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use watchtower_core::{Result, TenantId, TenantMonitor};
use watchtower_query::{collect_tags, dependency_tags, Registry};
use watchtower_store::Store;

/// "Resources of this content type changed for this tenant"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub tenant: TenantId,
    pub content_type: String,
}

/// Dependency tags of a burst of signals, per tenant
pub fn group_changes(changes: &[ResourceChange]) -> BTreeMap<TenantId, BTreeSet<String>> {
    let mut grouped: BTreeMap<TenantId, Vec<&str>> = BTreeMap::new();
    for change in changes {
        grouped
            .entry(change.tenant)
            .or_default()
            .push(change.content_type.as_str());
    }
    grouped
        .into_iter()
        .map(|(tenant, types)| (tenant, collect_tags(types)))
        .filter(|(_, tags)| !tags.is_empty())
        .collect()
}

pub struct EventDispatcher {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// Whether any table the query reads maps into `tags`
    pub fn matches(&self, sql: &str, tags: &BTreeSet<String>) -> bool {
        match dependency_tags(sql, &self.registry) {
            Ok(found) => !found.is_disjoint(tags),
            Err(err) => {
                warn!(error = %err, "Cannot read dependencies of query");
                false
            }
        }
    }

    /// Active tenant monitors of `tenant` that depend on any of `tags`
    pub async fn select(
        &self,
        tenant: TenantId,
        tags: &BTreeSet<String>,
    ) -> Result<Vec<TenantMonitor>> {
        let mut selected = Vec::new();
        for tm in self.store.list_tenant_monitors(tenant).await? {
            if !tm.active {
                continue;
            }
            let monitor = self.store.get_monitor(tm.monitor).await?;
            if self.matches(tm.effective_query(&monitor), tags) {
                selected.push(tm);
            }
        }
        debug!(tenant = %tenant, tags = ?tags, selected = selected.len(), "Dependency selection");
        Ok(selected)
    }
}
