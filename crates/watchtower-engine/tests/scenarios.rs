//! End-to-end scenarios over the in-memory store

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use serde_json::{json, Map};
use std::collections::BTreeMap;
use uuid::Uuid;
use watchtower_core::{
    ActionItemStatus, Exclusion, ExclusionEventType, ExcludedRow, HealthCondition, ResultData,
    Status, Urgency, WatcherList,
};
use watchtower_engine::exclusions::filter;
use watchtower_engine::notify::URGENT_SUBJECT;
use watchtower_engine::timeline::{build, TimelineEvent};
use watchtower_store::{ActionItemStore, ExclusionStore, MonitorStore, WatcherStore};

#[test]
fn exclusion_filter() {
    let mut vars = Map::new();
    vars.insert("monitors.monitor_id".into(), json!("1"));
    let mut data = ResultData::new(vec!["id".into()], vec![vec![json!("1")]]);
    data.variables = vec![vars.clone()];

    let exclusion = Exclusion {
        id: Uuid::new_v4(),
        tenant_monitor: Uuid::new_v4(),
        exclusion_date: Utc::now(),
        is_active: true,
        key: "monitors.monitor_id".into(),
        value: "1".into(),
        justification: "known".into(),
        snapshot: json!({}),
    };
    assert_eq!(filter(&mut data, &[exclusion.clone()]), 1);

    let expected = ResultData {
        columns: vec!["id".into()],
        data: vec![],
        error: None,
        variables: vec![],
        excluded_results: BTreeMap::from([(
            exclusion.id.to_string(),
            ExcludedRow {
                value: vec![json!("1")],
                variables: vars,
            },
        )]),
    };
    assert_eq!(data, expected);
}

#[tokio::test]
async fn deprecate_on_missing_row_then_renew() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;

    h.runner.set(answer(monitor_rows(&["1", "2"])));
    assert_eq!(h.evaluate(&tm).await.status(), Status::Triggered);

    let exclusion = h
        .exclusions
        .create(tm.id, "1", "accepted risk", None)
        .await
        .unwrap();

    // The row is gone from the source; the probe still sees data.
    h.runner.set(answer_split(monitor_rows(&["2"]), monitor_rows(&["2"])));
    let run = h.evaluate(&tm).await;
    assert_eq!(run.exclusion_events.len(), 1);
    assert_eq!(run.exclusion_events[0].event_type, ExclusionEventType::Deprecated);

    let run = h.evaluate(&tm).await;
    assert!(run.exclusion_events.is_empty());

    h.runner.set(answer(monitor_rows(&["1", "2"])));
    let run = h.evaluate(&tm).await;
    assert_eq!(run.exclusion_events.len(), 1);
    assert_eq!(run.exclusion_events[0].event_type, ExclusionEventType::Renewed);
    assert!(run
        .result
        .data
        .excluded_results
        .contains_key(&exclusion.id.to_string()));

    let history: Vec<_> = h
        .store
        .exclusion_events(exclusion.id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(
        history,
        vec![
            ExclusionEventType::Created,
            ExclusionEventType::Deprecated,
            ExclusionEventType::Renewed
        ]
    );
}

#[tokio::test]
async fn urgent_reconciliation() {
    let h = Harness::new().await;
    let u1 = h.user("member").await;
    let u2 = h.user("member").await;
    let tm = h
        .bind(exclusion_monitor().with_urgency(Urgency::Urgent))
        .await;
    h.store
        .set_watchers(&WatcherList {
            tenant_monitor: tm.id,
            users: [u1.id, u2.id].into_iter().collect(),
        })
        .await
        .unwrap();

    h.runner.set(answer(monitor_rows(&["7"])));
    let run = h.evaluate(&tm).await;
    assert_eq!(run.status(), Status::Triggered);
    let outcome = run.reconcile.unwrap();
    assert_eq!(outcome.created, 2);
    assert_eq!(outcome.notified, 2);

    let items = h.store.action_items(tm.id).await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items
        .iter()
        .all(|item| item.status == ActionItemStatus::NotStarted
            && item.description == "Flagged Monitor: Monitors without owner"));

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|email| email.subject == URGENT_SUBJECT && email.to.len() == 1));
    let mut recipients: Vec<_> = sent.iter().map(|email| email.to[0].clone()).collect();
    recipients.sort();
    let mut expected = vec![u1.email.clone(), u2.email.clone()];
    expected.sort();
    assert_eq!(recipients, expected);

    // Still triggered: nobody is emailed twice.
    let run = h.evaluate(&tm).await;
    assert_eq!(run.reconcile.unwrap().created, 0);
    assert_eq!(h.notifier.sent().len(), 2);
}

#[tokio::test]
async fn urgent_notifications_are_batched_per_recipient() {
    let h = Harness::new().await;
    let tm = h
        .bind(exclusion_monitor().with_urgency(Urgency::Urgent))
        .await;
    let mut users = Vec::new();
    for _ in 0..120 {
        users.push(h.user("member").await.id);
    }
    h.store
        .set_watchers(&WatcherList {
            tenant_monitor: tm.id,
            users: users.into_iter().collect(),
        })
        .await
        .unwrap();

    h.runner.set(answer(monitor_rows(&["7"])));
    let outcome = h.evaluate(&tm).await.reconcile.unwrap();
    assert_eq!(outcome.notified, 120);
    assert_eq!(h.notifier.sent().len(), 120);
}

#[test]
fn timeline_merge() {
    let day = |n: i64| Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap() - Duration::days(n);
    let start = Utc.with_ymd_and_hms(2024, 3, 12, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();
    let event = |n: i64, status: Status| TimelineEvent {
        at: day(n),
        status,
        query: "select id from monitors".into(),
        health_condition: HealthCondition::EmptyResults,
    };

    let events = vec![
        event(8, Status::Healthy),
        event(6, Status::Triggered),
        event(5, Status::Healthy),
        event(3, Status::Triggered),
        // repeats the open interval
        event(2, Status::Triggered),
    ];
    let intervals = build(start, end, &events).unwrap();

    let shape: Vec<_> = intervals
        .iter()
        .map(|i| (i.start, i.end, i.status))
        .collect();
    assert_eq!(
        shape,
        vec![
            (start, day(8), Status::NoDataDetected),
            (day(8), day(6), Status::Healthy),
            (day(6), day(5), Status::Triggered),
            (day(5), day(3), Status::Healthy),
            (day(3), end, Status::Triggered),
        ]
    );
}

#[tokio::test]
async fn reconciliation_follows_status_and_watchers() {
    let h = Harness::new().await;
    let admin = h.user(WATCHER_ROLE).await;
    let tm = h.bind(exclusion_monitor()).await;
    assert!(h.store.watchers(tm.id).await.unwrap().users.contains(&admin.id));

    h.runner.set(answer(monitor_rows(&["1"])));
    h.evaluate(&tm).await;
    assert_eq!(h.store.action_items(tm.id).await.unwrap().len(), 1);
    assert!(h.notifier.sent().is_empty());

    // Removing the watcher deletes the open item right away.
    assert!(h.watchers.remove_watcher(tm.id, admin.id).await.unwrap());
    assert!(h.store.action_items(tm.id).await.unwrap().is_empty());

    h.watchers.add_watcher(tm.id, admin.id).await.unwrap();
    assert_eq!(h.store.action_items(tm.id).await.unwrap().len(), 1);

    h.runner.set(answer(monitor_rows(&[])));
    assert_eq!(h.evaluate(&tm).await.status(), Status::NoDataDetected);
    assert!(h.store.action_items(tm.id).await.unwrap()[0].is_open());

    h.runner.set(answer_split(monitor_rows(&[]), monitor_rows(&["1"])));
    assert_eq!(h.evaluate(&tm).await.status(), Status::Healthy);
    let items = h.store.action_items(tm.id).await.unwrap();
    assert!(items.iter().all(|item| item.status == ActionItemStatus::Completed));
}

#[tokio::test]
async fn low_urgency_monitors_have_no_open_items() {
    let h = Harness::new().await;
    h.user(WATCHER_ROLE).await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));
    h.evaluate(&tm).await;
    assert_eq!(h.store.action_items(tm.id).await.unwrap().len(), 1);

    h.monitors.set_urgency(tm.id, Some(Urgency::Low)).await.unwrap();
    h.evaluate(&tm).await;
    assert!(h.store.action_items(tm.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn exclude_field_change_deletes_stale_exclusions() {
    let h = Harness::new().await;
    let tm = h.bind(exclusion_monitor()).await;
    h.runner.set(answer(monitor_rows(&["1"])));
    h.evaluate(&tm).await;
    let exclusion = h.exclusions.create(tm.id, "1", "ok", None).await.unwrap();

    let mut monitor = h.store.get_monitor(tm.monitor).await.unwrap();
    monitor.exclude_field = "monitors.name".into();
    h.monitors.update(monitor).await.unwrap();

    assert!(h.store.active_exclusions(tm.id).await.unwrap().is_empty());
    let last = h.store.exclusion_events(exclusion.id).await.unwrap();
    assert_eq!(last.last().unwrap().event_type, ExclusionEventType::Deleted);
}

#[tokio::test]
async fn urgent_notification_skips_unknown_watcher() {
    let h = Harness::new().await;
    let known = h.user("member").await;
    let tm = h
        .bind(exclusion_monitor().with_urgency(Urgency::Urgent))
        .await;
    h.store
        .set_watchers(&WatcherList {
            tenant_monitor: tm.id,
            users: [known.id, Uuid::new_v4()].into_iter().collect(),
        })
        .await
        .unwrap();

    h.runner.set(answer(monitor_rows(&["7"])));
    let outcome = h.evaluate(&tm).await.reconcile.unwrap();
    assert_eq!(outcome.created, 2);
    assert_eq!(outcome.notified, 1);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec![known.email.clone()]);
}

#[tokio::test]
async fn concurrent_reconciliations_open_one_item_per_watcher() {
    let h = Harness::new().await;
    let u1 = h.user("member").await;
    let u2 = h.user("member").await;
    let tm = h
        .bind(exclusion_monitor().with_urgency(Urgency::Urgent))
        .await;
    let unwatched = WatcherList {
        tenant_monitor: tm.id,
        users: Default::default(),
    };
    h.store.set_watchers(&unwatched).await.unwrap();
    h.runner.set(answer(monitor_rows(&["7"])));
    assert_eq!(h.evaluate(&tm).await.status(), Status::Triggered);
    assert!(h.store.action_items(tm.id).await.unwrap().is_empty());

    h.store
        .set_watchers(&WatcherList {
            tenant_monitor: tm.id,
            users: [u1.id, u2.id].into_iter().collect(),
        })
        .await
        .unwrap();
    let (first, second) = tokio::join!(
        h.reconciler.reconcile(tm.id),
        h.reconciler.reconcile(tm.id)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.created + second.created, 2);
    assert_eq!(h.store.action_items(tm.id).await.unwrap().len(), 2);
    assert_eq!(h.notifier.sent().len(), 2);
}
