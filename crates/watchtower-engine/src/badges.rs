//! "New" badges and the dashboard banner
//!
//! A tenant monitor is new for a user when its latest result is triggered
//! and was produced after the user last opened it and after the user last
//! looked at the dashboard. The banner lists new monitors until the user
//! closes it; the next triggered result brings it back.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use watchtower_core::{
    MonitorResult, Result, Status, TenantMonitorId, UserId, UserMonitorEvent,
    UserMonitorEventKind,
};
use watchtower_store::Store;

fn last_seen(
    events: &[UserMonitorEvent],
    kind: UserMonitorEventKind,
    tenant_monitor: Option<TenantMonitorId>,
) -> Option<DateTime<Utc>> {
    events
        .iter()
        .filter(|event| event.event == kind)
        .filter(|event| tenant_monitor.is_none() || event.tenant_monitor == tenant_monitor)
        .map(|event| event.at)
        .max()
}

/// Whether `latest` makes the tenant monitor new for the user whose
/// breadcrumbs are `events`
pub fn is_new(latest: Option<&MonitorResult>, events: &[UserMonitorEvent]) -> bool {
    let Some(result) = latest else {
        return false;
    };
    if result.status != Status::Triggered {
        return false;
    }
    let after = |seen: Option<DateTime<Utc>>| seen.map_or(true, |at| result.created_at > at);
    after(last_seen(
        events,
        UserMonitorEventKind::ViewDetail,
        Some(result.tenant_monitor),
    )) && after(last_seen(events, UserMonitorEventKind::ViewDashboard, None))
}

/// Whether the banner shows, given the latest results of the monitors that
/// are new for the user
pub fn banner_visible<'a>(
    new_results: impl IntoIterator<Item = &'a MonitorResult>,
    events: &[UserMonitorEvent],
) -> bool {
    let closed = last_seen(events, UserMonitorEventKind::CloseDynamicBanner, None);
    new_results
        .into_iter()
        .any(|result| closed.map_or(true, |at| result.created_at > at))
}

pub struct BadgeService {
    store: Arc<dyn Store>,
}

impl BadgeService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn record(&self, event: &UserMonitorEvent) -> Result<()> {
        self.store.record_user_event(event).await
    }

    async fn new_results(&self, user: UserId) -> Result<(Vec<MonitorResult>, Vec<UserMonitorEvent>)> {
        let member = self.store.get_user(user).await?;
        let events = self.store.user_events(user).await?;
        let mut results = Vec::new();
        for tm in self.store.list_tenant_monitors(member.tenant).await? {
            if !tm.active {
                continue;
            }
            let latest = self.store.latest_result(tm.id).await?;
            if is_new(latest.as_ref(), &events) {
                results.extend(latest);
            }
        }
        Ok((results, events))
    }

    /// Tenant monitors carrying a "new" badge for `user`
    pub async fn new_monitors(&self, user: UserId) -> Result<BTreeSet<TenantMonitorId>> {
        let (results, _) = self.new_results(user).await?;
        Ok(results.iter().map(|result| result.tenant_monitor).collect())
    }

    pub async fn show_banner(&self, user: UserId) -> Result<bool> {
        let (results, events) = self.new_results(user).await?;
        Ok(banner_visible(&results, &events))
    }
}
