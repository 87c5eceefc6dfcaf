//! Action items from monitor state
//!
//! After every evaluation (and every watcher change) the open action items of
//! a tenant monitor are brought in line with its status, urgency and watcher
//! list. Reconciliation only looks at current state, so running it twice is
//! harmless.

use crate::notify::{Email, Notifier, URGENT_SUBJECT, URGENT_TEMPLATE};
use crate::stats::record_notifications;
use chrono::{Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use watchtower_core::{
    ActionItem, ActionItemStatus, Monitor, Result, Status, TenantMonitor, TenantMonitorId,
    Urgency, UserId,
};
use watchtower_store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Days until a new action item is due
    #[serde(default = "default_due_days")]
    pub action_item_due_days: i64,

    /// Base URL of the web application, used in emails
    #[serde(default = "default_web_url")]
    pub web_url: String,

    /// Recipients per notification batch
    #[serde(default = "default_batch_size")]
    pub notification_batch_size: usize,
}

fn default_due_days() -> i64 {
    7
}

fn default_web_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_batch_size() -> usize {
    50
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            action_item_due_days: default_due_days(),
            web_url: default_web_url(),
            notification_batch_size: default_batch_size(),
        }
    }
}

/// What one reconciliation changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub completed: usize,
    pub deleted: usize,
    pub notified: usize,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    pub async fn reconcile(&self, tenant_monitor: TenantMonitorId) -> Result<ReconcileOutcome> {
        let tm = self.store.get_tenant_monitor(tenant_monitor).await?;
        let monitor = self.store.get_monitor(tm.monitor).await?;
        let urgency = tm.effective_urgency(&monitor);
        let open: Vec<ActionItem> = self
            .store
            .action_items(tm.id)
            .await?
            .into_iter()
            .filter(ActionItem::is_open)
            .collect();

        let mut outcome = ReconcileOutcome::default();
        if urgency == Urgency::Low || !tm.active {
            let ids: Vec<Uuid> = open.iter().map(|item| item.id).collect();
            if !ids.is_empty() {
                outcome.deleted = self.store.delete_action_items(&ids).await?;
            }
        } else {
            match tm.status {
                Status::ConnectionError | Status::NoDataDetected => {}
                Status::Healthy => {
                    let now = Utc::now();
                    for mut item in open {
                        item.status = ActionItemStatus::Completed;
                        item.completed_at = Some(now);
                        self.store.update_action_item(&item).await?;
                        outcome.completed += 1;
                    }
                }
                Status::Triggered => {
                    self.reconcile_triggered(&tm, &monitor, urgency, open, &mut outcome)
                        .await?;
                }
            }
        }

        if outcome != ReconcileOutcome::default() {
            info!(
                tenant_monitor = %tm.id,
                status = %tm.status,
                created = outcome.created,
                completed = outcome.completed,
                deleted = outcome.deleted,
                notified = outcome.notified,
                "Action items reconciled"
            );
        }
        Ok(outcome)
    }

    async fn reconcile_triggered(
        &self,
        tm: &TenantMonitor,
        monitor: &Monitor,
        urgency: Urgency,
        open: Vec<ActionItem>,
        outcome: &mut ReconcileOutcome,
    ) -> Result<()> {
        let watchers = self.store.watchers(tm.id).await?.users;
        let description = format!("Flagged Monitor: {}", tm.effective_name(monitor));

        let (kept, stale): (Vec<ActionItem>, Vec<ActionItem>) = open
            .into_iter()
            .partition(|item| watchers.contains(&item.assignee));
        if !stale.is_empty() {
            let ids: Vec<Uuid> = stale.iter().map(|item| item.id).collect();
            outcome.deleted = self.store.delete_action_items(&ids).await?;
        }

        let mut assigned = BTreeSet::new();
        for mut item in kept {
            assigned.insert(item.assignee);
            if item.description != description {
                item.description = description.clone();
                self.store.update_action_item(&item).await?;
                outcome.updated += 1;
            }
        }

        let now = Utc::now();
        let mut newcomers: Vec<UserId> = Vec::new();
        for assignee in watchers.difference(&assigned) {
            let item = ActionItem {
                id: Uuid::new_v4(),
                assignee: *assignee,
                tenant_monitor: tm.id,
                status: ActionItemStatus::NotStarted,
                due_date: now + Duration::days(self.config.action_item_due_days),
                description: description.clone(),
                reference_url: format!("/{}", monitor.id),
                created_at: now,
                completed_at: None,
            };
            // A concurrent reconciliation may have opened it first
            if self.store.insert_action_item(&item).await? {
                newcomers.push(*assignee);
                outcome.created += 1;
            }
        }

        if urgency == Urgency::Urgent && !newcomers.is_empty() {
            outcome.notified = self.notify_urgent(tm, monitor, &newcomers).await?;
        }
        Ok(())
    }

    /// One email per recipient, sent concurrently in batches. Failed sends
    /// are logged; the item already exists, so nobody is emailed twice.
    async fn notify_urgent(
        &self,
        tm: &TenantMonitor,
        monitor: &Monitor,
        users: &[UserId],
    ) -> Result<usize> {
        let mut recipients = Vec::with_capacity(users.len());
        for id in users {
            match self.store.get_user(*id).await {
                Ok(user) if user.active => recipients.push(user.email),
                Ok(_) => {}
                Err(err) => warn!(
                    user = %id,
                    tenant_monitor = %tm.id,
                    error = %err,
                    "Skipping notification recipient"
                ),
            }
        }

        let web_url = self.config.web_url.trim_end_matches('/');
        let context = json!({
            "monitor_name": tm.effective_name(monitor),
            "monitor_id": monitor.id,
            "monitor_url": format!("{web_url}/monitors/{}", monitor.id),
            "web_url": web_url,
        });

        let mut sent = 0;
        for batch in recipients.chunks(self.config.notification_batch_size.max(1)) {
            let emails: Vec<Email> = batch
                .iter()
                .map(|to| Email {
                    subject: URGENT_SUBJECT.to_string(),
                    to: vec![to.clone()],
                    template: URGENT_TEMPLATE.to_string(),
                    context: context.clone(),
                })
                .collect();
            let results =
                join_all(emails.iter().map(|email| self.notifier.send_email(email))).await;
            for (email, result) in emails.iter().zip(results) {
                match result {
                    Ok(()) => sent += 1,
                    Err(err) => warn!(to = ?email.to, error = %err, "Urgent notification failed"),
                }
            }
            debug!(batch = batch.len(), "Notification batch sent");
        }
        record_notifications(sent);
        Ok(sent)
    }
}
