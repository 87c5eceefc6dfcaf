//! Watchtower Query
//!
//! Analysis and rewriting of monitor queries.
//!
//! Monitor authors write a single read-only SELECT against logical tables
//! (`policies`, `people`, `lo_users`, ...) and cloud inventory tables
//! (`aws_*`, `azuread_*`, ...). This crate:
//! - Tokenizes and structurally parses the query
//! - Enforces the single-statement, read-only grammar and the table whitelist
//! - Rewrites logical tables into tenant-scoped subqueries
//! - Injects placeholder columns, exclusion predicates and unfiltered variants
//! - Maps tables and change signals to dependency tags

pub mod analyzer;
pub mod dependencies;
pub mod lexer;
pub mod parser;
pub mod registry;
pub mod rewriter;
pub mod typed_objects;
pub mod vendor;

pub use analyzer::{analyze, dependency_tags, infer_context, validate, Analysis};
pub use dependencies::{collect_tags, tags_for_content_type};
pub use registry::{ApplicationTable, BuildContext, QueryBuilder, Registry, TableKind};
pub use rewriter::{
    add_exclusion, build_unfiltered, compatible, inject_variables, placeholders,
    qualify_cloud_tables, rewrite, substitute_logical_tables, Placeholder,
};
pub use typed_objects::{Attribute, AttributeType, TypedObjectSpec, TypedObjectTable};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::analyzer::{analyze, validate, Analysis};
    pub use crate::registry::{BuildContext, QueryBuilder, Registry};
    pub use crate::rewriter::{build_unfiltered, compatible, rewrite};
}
