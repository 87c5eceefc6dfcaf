//! Monitor query analysis and validation

use crate::parser::{self, ClauseKind, FromSource, Select, Statement};
use crate::registry::{Registry, TableKind};
use crate::vendor;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use watchtower_core::{Error, QueryContext, Result};

/// Structure of an accepted monitor query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analysis {
    /// Tables referenced anywhere in the query, in order of appearance
    pub tables: Vec<String>,

    /// Set-returning functions used in FROM lists
    pub functions: Vec<String>,

    /// FROM-list aliases mapped to the table or function they name
    pub aliases: BTreeMap<String, String>,

    /// Text of the top-level selection list
    pub selected_columns: String,

    /// Body of the top-level WHERE clause
    #[serde(skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Text of every nested query
    pub subqueries: Vec<String>,
}

/// Parse a query and describe its structure.
///
/// Enforces the single-statement and read-only rules; table names are not
/// checked, see [`validate`].
pub fn analyze(sql: &str) -> Result<Analysis> {
    let statement = parser::parse(sql)?;
    Ok(describe(sql, &statement))
}

/// [`analyze`] plus the requirement that every FROM-list name is a logical
/// table, a cloud vendor table or a safe function
pub fn validate(sql: &str, registry: &Registry) -> Result<Analysis> {
    let statement = parser::parse(sql)?;
    check_relations(&statement.select, registry)?;
    Ok(describe(sql, &statement))
}

fn check_relations(select: &Select, registry: &Registry) -> Result<()> {
    for item in select.relations() {
        match &item.source {
            FromSource::Table { name, schema, .. } => match registry.classify(name) {
                None => return Err(Error::unknown_table(name.as_str())),
                // The runner picks the profile schema; authors never do
                Some(TableKind::Cloud(_)) if schema.is_some() => {
                    return Err(Error::parse(format!(
                        "Cloud table \"{name}\" cannot be schema-qualified"
                    )));
                }
                Some(_) => {}
            },
            FromSource::Function { name } if !registry.is_safe_function(name) => {
                return Err(Error::unknown_table(name.as_str()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn describe(sql: &str, statement: &Statement) -> Analysis {
    let select = &statement.select;

    let mut tables = Vec::new();
    let mut functions = Vec::new();
    let mut aliases = BTreeMap::new();
    for item in select.relations() {
        let name = match &item.source {
            FromSource::Table { name, .. } => {
                push_unique(&mut tables, name);
                name
            }
            FromSource::Function { name } => {
                push_unique(&mut functions, name);
                name
            }
            _ => continue,
        };
        if let Some(alias) = &item.alias {
            aliases.insert(alias.clone(), name.clone());
        }
    }

    let mut subqueries = Vec::new();
    let mut pending = select.children();
    while let Some(query) = pending.pop() {
        subqueries.push(sql[query.span.clone()].to_string());
        pending.extend(query.children());
    }

    Analysis {
        tables,
        functions,
        aliases,
        selected_columns: sql[select.projection.clone()].to_string(),
        where_clause: select
            .clause(ClauseKind::Where)
            .map(|clause| sql[clause.body.clone()].to_string()),
        limit: select.limit,
        subqueries,
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

/// Runner context from the leading FROM-list table
pub fn infer_context(sql: &str) -> Result<QueryContext> {
    let statement = parser::parse(sql)?;
    Ok(context_of(&statement.select))
}

pub(crate) fn context_of(select: &Select) -> QueryContext {
    select
        .first_table()
        .and_then(vendor::vendor_of_table)
        .map_or(QueryContext::Internal, QueryContext::Cloud)
}

/// Dependency tags of every table the query reads
pub fn dependency_tags(sql: &str, registry: &Registry) -> Result<BTreeSet<String>> {
    let statement = parser::parse(sql)?;
    Ok(statement
        .select
        .relations()
        .into_iter()
        .filter_map(|item| item.table_name())
        .filter_map(|name| registry.dependency_of(name))
        .collect())
}
