use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use uuid::Uuid;
use watchtower_core::{Exclusion, HealthCondition, ResultData, Status};
use watchtower_engine::classifier::{apply_no_data, classify};
use watchtower_engine::exclusions::{filter, restore};

const KEY: &str = "people.id";

fn exclusion(value: &str) -> Exclusion {
    Exclusion {
        id: Uuid::new_v4(),
        tenant_monitor: Uuid::new_v4(),
        exclusion_date: Utc::now(),
        is_active: true,
        key: KEY.into(),
        value: value.into(),
        justification: "generated".into(),
        snapshot: Value::Null,
    }
}

fn data_with_keys(keys: &[u8]) -> ResultData {
    let mut data = ResultData::new(
        vec!["name".into()],
        keys.iter().map(|k| vec![json!(format!("row {k}"))]).collect(),
    );
    data.variables = keys
        .iter()
        .map(|k| {
            let mut vars = Map::new();
            vars.insert(KEY.into(), json!(k.to_string()));
            vars
        })
        .collect();
    data
}

fn sorted_rows(data: &ResultData) -> Vec<String> {
    let mut rows: Vec<String> = data
        .data
        .iter()
        .zip(&data.variables)
        .map(|(row, vars)| format!("{row:?} {vars:?}"))
        .collect();
    rows.sort();
    rows
}

fn status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Healthy),
        Just(Status::Triggered),
        Just(Status::NoDataDetected),
        Just(Status::ConnectionError),
    ]
}

fn health_condition() -> impl Strategy<Value = HealthCondition> {
    prop_oneof![
        Just(HealthCondition::EmptyResults),
        Just(HealthCondition::ReturnResults)
    ]
}

fn result_data() -> impl Strategy<Value = ResultData> {
    (
        prop::collection::vec("[a-z]{1,4}", 0..3),
        prop::collection::vec(any::<i32>(), 0..6),
        prop::option::of("[a-z ]{1,12}"),
    )
        .prop_map(|(columns, cells, error)| {
            let mut data = ResultData::new(
                columns,
                cells.into_iter().map(|c| vec![json!(c)]).collect(),
            );
            data.error = error;
            data
        })
}

proptest! {
    #[test]
    fn filtering_twice_changes_nothing(
        keys in prop::collection::vec(0u8..8, 0..12),
        excluded in prop::collection::vec(0u8..8, 0..4),
    ) {
        let exclusions: Vec<Exclusion> =
            excluded.iter().map(|k| exclusion(&k.to_string())).collect();
        let mut data = data_with_keys(&keys);
        filter(&mut data, &exclusions);
        let once = data.clone();

        prop_assert_eq!(filter(&mut data, &exclusions), 0);
        prop_assert_eq!(data, once);
    }

    #[test]
    fn each_exclusion_holds_one_row(
        keys in prop::collection::vec(0u8..4, 0..12),
        value in 0u8..4,
    ) {
        let mut data = data_with_keys(&keys);
        let before = data.row_count();
        let moved = filter(&mut data, &[exclusion(&value.to_string())]);

        let expected = usize::from(keys.contains(&value));
        prop_assert_eq!(moved, expected);
        prop_assert_eq!(data.row_count(), before - expected);
        prop_assert_eq!(data.variables.len(), data.row_count());
    }

    #[test]
    fn restore_undoes_filter(
        keys in prop::collection::hash_set(0u8..32, 1..10),
        pick in any::<prop::sample::Index>(),
    ) {
        let keys: Vec<u8> = keys.into_iter().collect();
        let target = keys[pick.index(keys.len())];
        let original = data_with_keys(&keys);

        let excl = exclusion(&target.to_string());
        let mut data = original.clone();
        prop_assert_eq!(filter(&mut data, std::slice::from_ref(&excl)), 1);
        prop_assert!(restore(&mut data, excl.id));

        prop_assert!(data.excluded_results.is_empty());
        prop_assert_eq!(sorted_rows(&data), sorted_rows(&original));
        prop_assert!(!restore(&mut data, excl.id));
    }

    #[test]
    fn classification_is_total(data in result_data(), hc in health_condition()) {
        let status = classify(&data, hc);
        if data.is_error() || data.columns.is_empty() {
            prop_assert_eq!(status, Status::ConnectionError);
        } else {
            prop_assert!(matches!(status, Status::Healthy | Status::Triggered));
        }
    }

    #[test]
    fn missing_source_data_is_never_healthy_or_triggered(status in status()) {
        let downgraded = apply_no_data(status, false);
        prop_assert!(!matches!(downgraded, Status::Healthy | Status::Triggered));
        prop_assert_eq!(apply_no_data(status, true), status);
    }
}
