//! Evaluator, scheduler and definition flows against the in-memory store

mod common;

use chrono::{Duration, Utc};
use common::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use watchtower_core::{
    Error, ExclusionEventType, Monitor, MonitorKind, Status, UserMonitorEvent,
    UserMonitorEventKind,
};
use watchtower_engine::export::{EXCLUDED_RESULTS, LAST_RESULT, METADATA, UNFILTERED_DATA};
use watchtower_engine::{
    BadgeService, EvaluatorConfig, ExportService, ResourceChange, SnapshotOptions,
};
use watchtower_runner::{Dispatcher, RunOutput};
use watchtower_store::{
    ActionItemStore, ExclusionStore, MonitorStore, ResultStore, Store, WatcherStore,
};

#[tokio::test]
async fn test_empty_source_is_no_data() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;

    h.runner.set(answer(monitor_rows(&[])));
    let run = h.evaluate(&tm).await;
    assert_eq!(run.status(), Status::NoDataDetected);
    assert_eq!(h.runner.calls().iter().filter(|sql| is_unfiltered(sql)).count(), 1);

    let stored = h.store.get_tenant_monitor(tm.id).await.unwrap();
    assert_eq!(stored.status, Status::NoDataDetected);
}

#[tokio::test]
async fn test_variables_are_split_from_rows() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;

    h.runner.set(answer(monitor_rows(&["4"])));
    let data = h.evaluate(&tm).await.result.data;
    assert_eq!(data.columns, vec!["id"]);
    assert_eq!(data.data, vec![vec![json!("4")]]);
    assert_eq!(data.variables[0]["monitors.monitor_id"], json!("4"));
}

#[tokio::test]
async fn test_oversized_result_is_replaced() {
    let h = Harness::with_config(EvaluatorConfig {
        max_result_bytes: 256,
        ..Default::default()
    })
    .await;
    let tm = h.bind(exclusion_monitor()).await;

    let ids: Vec<String> = (0..100).map(|i| format!("monitor-{i}")).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    h.runner.set(answer(monitor_rows(&ids)));

    let run = h.evaluate(&tm).await;
    assert_eq!(run.status(), Status::ConnectionError);
    assert!(run.result.data.data.is_empty());
    assert!(run.result.data.error.unwrap().contains("too large"));
}

#[tokio::test]
async fn test_backend_failure_is_persisted() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;

    h.runner.set(|_| Err(Error::database("connection refused")));
    let run = h.evaluate(&tm).await;
    assert_eq!(run.status(), Status::ConnectionError);
    assert_eq!(run.result.data.error.as_deref(), Some("connection refused"));
    // no probe after a failed run
    assert_eq!(h.runner.calls().len(), 1);

    let latest = h.store.latest_result(tm.id).await.unwrap().unwrap();
    assert_eq!(latest.id, run.result.id);
}

#[tokio::test]
async fn test_rejected_query_persists_nothing() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;

    h.runner.set(|_| Err(Error::unknown_table("secrets")));
    let err = h
        .evaluator
        .evaluate(tm.id, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_rejection());
    assert!(h.store.latest_result(tm.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_run_persists_nothing() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.evaluator.evaluate(tm.id, None, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(h.store.latest_result(tm.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_inactive_tenant_monitor_is_not_evaluated() {
    let h = Harness::new().await;
    h.user(WATCHER_ROLE).await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));
    assert_eq!(h.evaluate(&tm).await.status(), Status::Triggered);
    assert_eq!(h.store.action_items(tm.id).await.unwrap().len(), 1);
    let calls = h.runner.calls().len();

    h.monitors.set_active(tm.id, false).await.unwrap();
    assert!(h.store.action_items(tm.id).await.unwrap().is_empty());

    let err = h
        .evaluator
        .evaluate(tm.id, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(h.runner.calls().len(), calls);

    h.scheduler.refresh_tenant(h.tenant.id).await.unwrap();
    assert!(h.store.action_items(tm.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_revert_restores_row_and_status() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));
    h.evaluate(&tm).await;

    let exclusion = h.exclusions.create(tm.id, "1", "ok", None).await.unwrap();
    assert_eq!(exclusion.snapshot, json!({"id": "1"}));
    let latest = h.store.latest_result(tm.id).await.unwrap().unwrap();
    assert_eq!(latest.status, Status::Healthy);
    assert_eq!(
        h.store.get_tenant_monitor(tm.id).await.unwrap().status,
        Status::Healthy
    );

    h.exclusions.revert(exclusion.id, "not ok", None).await.unwrap();
    let latest = h.store.latest_result(tm.id).await.unwrap().unwrap();
    assert_eq!(latest.status, Status::Triggered);
    assert_eq!(latest.data.data, vec![vec![json!("1")]]);
    assert!(latest.data.excluded_results.is_empty());

    let err = h.exclusions.revert(exclusion.id, "again", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_clone_moves_binding_to_custom_copy() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));
    h.evaluate(&tm).await;
    h.exclusions.create(tm.id, "1", "ok", None).await.unwrap();
    h.monitors
        .set_query_override(tm.id, Some("select id from monitors where id > 0".into()))
        .await
        .unwrap();

    let clone = h.monitors.clone_monitor(tm.monitor, h.tenant.id).await.unwrap();
    assert_eq!(clone.kind, MonitorKind::Custom);
    assert_eq!(clone.owner, Some(h.tenant.id));
    assert_eq!(clone.parent_monitor, Some(tm.monitor));
    assert_eq!(clone.query, "select id from monitors where id > 0");
    assert_eq!(clone.exclude_field, "monitors.monitor_id");

    let moved = h.store.get_tenant_monitor(tm.id).await.unwrap();
    assert_eq!(moved.monitor, clone.id);
    assert!(moved.query.is_none());
    assert!(h.store.active_exclusions(tm.id).await.unwrap().is_empty());

    // The system monitor is not bound again next to its copy.
    assert_eq!(h.scheduler.materialize(h.tenant.id).await.unwrap(), 0);

    let err = h
        .monitors
        .clone_monitor(clone.id, h.tenant.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_kind_cannot_change() {
    let h = Harness::new().await;
    let monitor = h.monitors.create(exclusion_monitor()).await.unwrap();
    let mut edited = monitor.clone();
    edited.kind = MonitorKind::Custom;
    edited.owner = Some(h.tenant.id);
    assert!(matches!(
        h.monitors.update(edited).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_custom_monitor_of_other_tenant_cannot_bind() {
    let h = Harness::new().await;
    let other = watchtower_core::Tenant::new("Other");
    let custom = h
        .monitors
        .create(Monitor::custom(other.id, "Mine", "select id from people"))
        .await
        .unwrap();
    assert!(matches!(
        h.monitors.bind(h.tenant.id, custom.id).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_materialize_respects_validation_query() {
    let h = Harness::new().await;
    let applies = h
        .monitors
        .create(
            Monitor::system("Policies", "select id from policies")
                .with_validation_query("select id from people where id = 'yes'"),
        )
        .await
        .unwrap();
    let skipped = h
        .monitors
        .create(
            Monitor::system("People", "select id from people")
                .with_validation_query("select id from people where id = 'no'"),
        )
        .await
        .unwrap();

    h.runner.set(|sql| {
        if sql.contains("'yes'") {
            Ok(RunOutput::single(rows(&[json!(1)])))
        } else {
            Ok(RunOutput::single(rows(&[])))
        }
    });

    assert_eq!(h.scheduler.materialize(h.tenant.id).await.unwrap(), 1);
    let bound: Vec<_> = h
        .store
        .list_tenant_monitors(h.tenant.id)
        .await
        .unwrap()
        .into_iter()
        .map(|tm| tm.monitor)
        .collect();
    assert_eq!(bound, vec![applies.id]);
    assert!(!bound.contains(&skipped.id));

    // Idempotent
    assert_eq!(h.scheduler.materialize(h.tenant.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_refresh_tenant_binds_and_evaluates() {
    let h = Harness::new().await;
    h.monitors.create(exclusion_monitor()).await.unwrap();
    h.monitors
        .create(Monitor::system("People", "select id from people"))
        .await
        .unwrap();
    h.runner.set(answer(monitor_rows(&["1"])));

    let summary = h.scheduler.refresh_tenant(h.tenant.id).await.unwrap();
    assert_eq!(summary.job, "refresh_tenant");
    assert_eq!(summary.created, 2);
    assert_eq!(summary.evaluated, 2);
    assert!(summary.errors.is_empty());
    assert!(summary.per_org_time.contains_key(&h.tenant.id));
    assert_eq!(summary.stats.evaluations(), 2);
}

#[tokio::test]
async fn test_refresh_collects_failures() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(|_| Err(Error::unknown_table("secrets")));

    let summary = h.scheduler.refresh_all().await.unwrap();
    assert_eq!(summary.evaluated, 0);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains(&tm.id.to_string()));
}

#[tokio::test]
async fn test_refresh_by_dependencies_selects_matching_monitors() {
    let h = Harness::new().await;
    let people = h
        .bind(Monitor::system("People", "select id from people"))
        .await;
    let policies = h
        .bind(Monitor::system("Policies", "select id from policies"))
        .await;

    let deps = BTreeSet::from(["people_dependency".to_string()]);
    let summary = h
        .scheduler
        .refresh_by_dependencies(h.tenant.id, &deps)
        .await
        .unwrap();
    assert_eq!(summary.evaluated, 1);
    assert!(h.store.latest_result(people.id).await.unwrap().is_some());
    assert!(h.store.latest_result(policies.id).await.unwrap().is_none());

    let summary = h
        .scheduler
        .handle_changes(&[ResourceChange {
            tenant: h.tenant.id,
            content_type: "policy_policy".into(),
        }])
        .await
        .unwrap();
    assert_eq!(summary.evaluated, 1);
    assert!(h.store.latest_result(policies.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_inactive_tenant_is_not_refreshed() {
    let h = Harness::new().await;
    let mut tenant = h.tenant.clone();
    tenant.active = false;
    watchtower_store::TenantStore::upsert_tenant(h.store.as_ref(), &tenant)
        .await
        .unwrap();

    assert!(h.scheduler.refresh_tenant(tenant.id).await.is_err());
    let summary = h.scheduler.refresh_all().await.unwrap();
    assert!(summary.per_org_time.is_empty());
}

#[tokio::test]
async fn test_run_tenant_monitor_on_pool() {
    let h = Harness::new().await;
    let user = h.user("member").await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));

    let run = h
        .scheduler
        .run_tenant_monitor(tm.id, Some(user.id))
        .await
        .unwrap();
    assert_eq!(run.status(), Status::Triggered);
    assert_eq!(run.result.user, Some(user.id));
}

#[tokio::test]
async fn test_sweep_removes_only_old_inactive_exclusions() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1", "2"])));
    h.evaluate(&tm).await;

    let reverted = h.exclusions.create(tm.id, "1", "ok", None).await.unwrap();
    let kept = h.exclusions.create(tm.id, "2", "ok", None).await.unwrap();
    h.exclusions.revert(reverted.id, "undo", None).await.unwrap();

    let summary = h.scheduler.sweep_exclusions(Duration::hours(1)).await.unwrap();
    assert_eq!(summary.removed, Some(0));

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let summary = h
        .scheduler
        .sweep_exclusions(Duration::milliseconds(5))
        .await
        .unwrap();
    assert_eq!(summary.removed, Some(1));
    assert!(h.store.get_exclusion(reverted.id).await.is_err());
    assert!(h.store.get_exclusion(kept.id).await.unwrap().is_active);
}

#[tokio::test]
async fn test_clean_gateway_without_gateway() {
    let h = Harness::new().await;
    let summary = h.scheduler.clean_gateway().await.unwrap();
    assert_eq!(summary.job, "clean_gateway");
    assert_eq!(summary.removed, Some(0));
}

#[tokio::test]
async fn test_snapshot_sheets() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner
        .set(answer_split(monitor_rows(&["1", "2"]), monitor_rows(&["1", "2", "3"])));
    h.evaluate(&tm).await;
    h.exclusions
        .create(tm.id, "2", "known, accepted", None)
        .await
        .unwrap();

    let store: Arc<dyn Store> = h.store.clone();
    let dispatcher = Arc::new(Dispatcher::new(h.runner.clone(), h.runner.clone()));
    let snapshot = ExportService::new(store, dispatcher, 10)
        .snapshot(
            tm.id,
            SnapshotOptions {
                include_unfiltered: true,
                include_metadata: true,
                limit: None,
            },
        )
        .await
        .unwrap();

    let names: Vec<_> = snapshot.sheets.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![LAST_RESULT, UNFILTERED_DATA, METADATA, EXCLUDED_RESULTS]);

    let last = snapshot.sheet(LAST_RESULT).unwrap();
    assert_eq!(last.columns, vec!["id"]);
    assert_eq!(last.rows, vec![vec![json!("1")]]);
    assert_eq!(snapshot.sheet(UNFILTERED_DATA).unwrap().rows.len(), 3);

    let excluded = snapshot.sheet(EXCLUDED_RESULTS).unwrap();
    assert_eq!(excluded.rows.len(), 1);
    assert_eq!(excluded.rows[0][0], json!("System"));
    assert_eq!(excluded.rows[0][3], json!("known, accepted"));

    let csv = snapshot.to_csv().unwrap();
    assert_eq!(csv[0], (LAST_RESULT.to_string(), "id\n1\n".to_string()));
    assert!(snapshot.to_json().unwrap()["sheets"].is_array());
}

#[tokio::test]
async fn test_badges_follow_user_events() {
    let h = Harness::new().await;
    let user = h.user("member").await;
    let tm = h.bind(exclusion_monitor()).await;
    let badges = BadgeService::new(h.store.clone());

    assert!(badges.new_monitors(user.id).await.unwrap().is_empty());

    h.runner.set(answer(monitor_rows(&["1"])));
    h.evaluate(&tm).await;
    assert_eq!(
        badges.new_monitors(user.id).await.unwrap(),
        BTreeSet::from([tm.id])
    );
    assert!(badges.show_banner(user.id).await.unwrap());

    badges
        .record(&UserMonitorEvent {
            user: user.id,
            tenant_monitor: None,
            event: UserMonitorEventKind::CloseDynamicBanner,
            at: Utc::now(),
        })
        .await
        .unwrap();
    assert!(!badges.show_banner(user.id).await.unwrap());

    badges
        .record(&UserMonitorEvent {
            user: user.id,
            tenant_monitor: Some(tm.id),
            event: UserMonitorEventKind::ViewDetail,
            at: Utc::now(),
        })
        .await
        .unwrap();
    assert!(badges.new_monitors(user.id).await.unwrap().is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    h.evaluate(&tm).await;
    assert!(badges.show_banner(user.id).await.unwrap());
}

#[tokio::test]
async fn test_justification_update_is_recorded() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));
    h.evaluate(&tm).await;
    let exclusion = h.exclusions.create(tm.id, "1", "ok", None).await.unwrap();
    h.exclusions
        .update_justification(exclusion.id, "still ok", None)
        .await
        .unwrap();

    let records = h.exclusions.list(tm.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].exclusion.justification, "still ok");
    assert_eq!(
        records[0].last_event(),
        Some(ExclusionEventType::UpdatedJustification)
    );
}

#[tokio::test]
async fn test_subscriptions_override_roles() {
    let h = Harness::new().await;
    let admin = h.user(WATCHER_ROLE).await;
    let member = h.user("member").await;
    let first = h.bind(exclusion_monitor()).await;
    let second = h
        .bind(Monitor::system("People", "select id from people"))
        .await;

    assert_eq!(h.watchers.subscribe(h.tenant.id, member.id).await.unwrap(), 2);
    assert_eq!(h.watchers.unsubscribe(h.tenant.id, admin.id).await.unwrap(), 2);
    for tm in [&first, &second] {
        let users = h.store.watchers(tm.id).await.unwrap().users;
        assert_eq!(users, BTreeSet::from([member.id]));
    }

    // Later monitors start from the same defaults.
    let third = h
        .bind(Monitor::system("Policies", "select id from policies"))
        .await;
    assert_eq!(
        h.store.watchers(third.id).await.unwrap().users,
        BTreeSet::from([member.id])
    );

    let outsider = watchtower_core::Tenant::new("Elsewhere");
    assert!(matches!(
        h.watchers.subscribe(outsider.id, member.id).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_role_change_moves_user_across_lists() {
    let h = Harness::new().await;
    let mut user = h.user("member").await;
    let tm = h.bind(exclusion_monitor()).await;
    assert!(h.store.watchers(tm.id).await.unwrap().users.is_empty());

    user.role = WATCHER_ROLE.into();
    watchtower_store::TenantStore::upsert_user(h.store.as_ref(), &user)
        .await
        .unwrap();
    assert_eq!(h.watchers.on_role_changed(user.id, "member").await.unwrap(), 1);
    assert!(h.store.watchers(tm.id).await.unwrap().users.contains(&user.id));

    // Same side of the default roles: nothing to do.
    assert_eq!(h.watchers.on_role_changed(user.id, "admin").await.unwrap(), 0);

    user.role = "member".into();
    watchtower_store::TenantStore::upsert_user(h.store.as_ref(), &user)
        .await
        .unwrap();
    assert_eq!(h.watchers.on_role_changed(user.id, WATCHER_ROLE).await.unwrap(), 1);
    assert!(h.store.watchers(tm.id).await.unwrap().users.is_empty());
}
