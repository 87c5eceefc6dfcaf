//! End-to-end tests for analysis and rewriting of monitor queries

use proptest::prelude::*;
use uuid::Uuid;
use watchtower_core::{Error, QueryContext};
use watchtower_query::{
    analyze, build_unfiltered, compatible, infer_context, rewrite, validate, BuildContext,
    Registry,
};

#[test]
fn parser_rejects_non_select() {
    let err = analyze("drop table foo;").unwrap_err();
    match err {
        Error::Parse(msg) => {
            assert_eq!(msg, "DROP is not allowed. Monitors support read-only operations.")
        }
        other => panic!("expected a parse error, got {other:?}"),
    }
}

#[test]
fn rewriter_unfilters() {
    let unfiltered =
        build_unfiltered("select * from lo_users where id = 'x' LIMIT 20", 10).unwrap();
    assert_eq!(unfiltered, "select * from lo_users limit 10");
}

#[test]
fn multiple_statements_rejected_even_with_comments() {
    let err = analyze("select 1 from people; /* sneaky */ delete from people").unwrap_err();
    assert_eq!(err.to_string(), "2 or more queries are not allowed.");
}

#[test]
fn full_rewrite_of_typed_object_query() {
    let registry = Registry::builtin().unwrap();
    let tenant = Uuid::new_v4();
    let users_type = Uuid::new_v4();
    let mut ctx = BuildContext::new(tenant);
    ctx.object_types.insert("users".into(), users_type);

    let sql = "select u.email from lo_users u where u.mfa_enabled = 'false'";
    validate(sql, &registry).unwrap();

    let rewritten = rewrite(sql, "https://idp.example.com/users/$lo_users.id", "", &registry, &ctx)
        .unwrap();

    assert!(rewritten.starts_with("select u.email, u.id AS tv_lo_users__id from (SELECT id AS lo_id"));
    assert!(rewritten.contains(&format!("type_id = '{users_type}' AND deleted_at IS NULL) AS u")));
    assert!(rewritten.ends_with("where u.mfa_enabled = 'false'"));
}

#[test]
fn missing_object_type_yields_empty_table() {
    let registry = Registry::builtin().unwrap();
    let ctx = BuildContext::new(Uuid::new_v4());
    let rewritten = rewrite("select * from lo_devices", "", "", &registry, &ctx).unwrap();
    assert!(rewritten.contains("FROM objects WHERE false) AS lo_devices"));
}

#[test]
fn cloud_context_from_first_table() {
    assert_eq!(
        infer_context("select name from gcp_compute_instance").unwrap(),
        QueryContext::Cloud(watchtower_core::CloudVendor::Gcp)
    );
}

fn column() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("id".to_string()),
        Just("p.name".to_string()),
        Just("count(*)".to_string()),
        Just("coalesce(p.owner_id, 'none')".to_string()),
        Just("case when p.is_published then 'yes' else 'no' end".to_string()),
        Just("(select max(id) from people)".to_string()),
    ]
}

fn alias() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        "[a-z]{1,8}".prop_map(|a| Some(format!("AS alias_{a}"))),
        "[a-z]{1,8}".prop_map(|a| Some(format!("col_{a}"))),
    ]
}

fn filter() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("where p.is_published = false".to_string())),
        Just(Some("WHERE p.id IN (SELECT owner_id FROM policies LIMIT 3)".to_string())),
        Just(Some("where p.name like '%;%' and p.id is not null".to_string())),
    ]
}

fn monitor_query() -> impl Strategy<Value = String> {
    (
        prop::collection::vec((column(), alias()), 1..4),
        prop_oneof![Just("policies p"), Just("people p"), Just("policies AS p")],
        filter(),
        prop::option::of(1u64..500),
        any::<bool>(),
    )
        .prop_map(|(columns, from, filter, limit, semicolon)| {
            let selection: Vec<String> = columns
                .into_iter()
                .map(|(column, alias)| match alias {
                    Some(alias) => format!("{column} {alias}"),
                    None => column,
                })
                .collect();
            let mut sql = format!("select {} from {from}", selection.join(", "));
            if let Some(filter) = filter {
                sql.push(' ');
                sql.push_str(&filter);
            }
            if let Some(limit) = limit {
                sql.push_str(&format!(" limit {limit}"));
            }
            if semicolon {
                sql.push(';');
            }
            sql
        })
}

proptest! {
    #[test]
    fn unfiltered_variant_is_compatible(query in monitor_query(), limit in 1u64..100) {
        let unfiltered = build_unfiltered(&query, limit).unwrap();
        prop_assert!(compatible(&query, &unfiltered), "{query} vs {unfiltered}");
        let analysis = analyze(&unfiltered).unwrap();
        prop_assert_eq!(analysis.limit, Some(limit));
        prop_assert!(analysis.where_clause.is_none());
    }

    #[test]
    fn accepted_queries_are_single_selects(query in monitor_query()) {
        let registry = Registry::builtin().unwrap();
        prop_assert!(validate(&query, &registry).is_ok());
    }
}
