use std::collections::BTreeSet;
use uuid::Uuid;
use watchtower_query::{analyze, BuildContext, QueryBuilder, Registry};
use watchtower_store::{PgStore, PoolConfig};

const SCHEMA: &str = include_str!("../migrations/0001_watchtower.sql");

fn schema_tables() -> BTreeSet<String> {
    SCHEMA
        .lines()
        .filter_map(|line| line.trim().strip_prefix("CREATE TABLE IF NOT EXISTS "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn built(registry: &Registry, name: &str) -> String {
    let builder = registry.get(name).unwrap();
    builder.build(&BuildContext::new(Uuid::new_v4()))
}

#[test]
fn schema_uses_persisted_table_names() {
    let tables = schema_tables();
    for name in [
        "monitor",
        "tenant_monitor",
        "monitor_result",
        "monitor_exclusion",
        "monitor_exclusion_event",
        "monitor_user_event",
        "monitor_subscription_event",
        "watcher_list",
        "watcher_list_users",
    ] {
        assert!(tables.contains(name), "schema does not create {name}");
    }
}

#[test]
fn monitor_logical_tables_read_schema_relations() {
    let registry = Registry::builtin().unwrap();
    let tables = schema_tables();
    for name in ["monitors", "monitor_results"] {
        let sql = built(&registry, name);
        for relation in analyze(&sql).unwrap().tables {
            assert!(
                tables.contains(&relation),
                "{name} reads {relation}, which the schema does not create"
            );
        }
    }
}

/// Runs every builtin logical table backed by this schema. Tables of the
/// host application are skipped.
#[tokio::test]
#[ignore = "needs a PostgreSQL database in WATCHTOWER_TEST_DATABASE_URL"]
async fn logical_tables_run_against_migrated_schema() {
    let url = std::env::var("WATCHTOWER_TEST_DATABASE_URL").unwrap();
    let store = PgStore::connect(&url, &PoolConfig::default()).await.unwrap();
    store.migrate().await.unwrap();

    let registry = Registry::builtin().unwrap();
    let tables = schema_tables();
    let mut ran = 0;
    for name in registry.names() {
        let sql = built(&registry, name);
        let reads = analyze(&sql).unwrap().tables;
        if !reads.iter().all(|relation| tables.contains(relation)) {
            continue;
        }
        sqlx::query(&sql)
            .fetch_all(store.pool())
            .await
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        ran += 1;
    }
    assert!(ran >= 2);
}
