//! Typed object tables (`lo_*`)
//!
//! The schema of these tables lives in data, not code: each spec names the
//! tenant object type to read and the attributes stored in the object's
//! `data` document.

use crate::registry::{BuildContext, QueryBuilder};
use crate::rewriter::{quote_ident, quote_literal};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;
use watchtower_core::{Error, Result};

/// Dependency tag shared by every typed object table
pub const TYPED_OBJECT_DEPENDENCY: &str = "lo_dependency";

const BUILTIN_SPECS: &str = include_str!("typed_objects.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    Text,
    Number,
    Boolean,
    Date,
    #[serde(rename = "JSON")]
    Json,
    User,
    Select,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
}

impl Attribute {
    /// `data->>'Name' AS name`, keeping JSON values as JSON
    fn projection(&self) -> String {
        let operator = match self.kind {
            AttributeType::Json => "->",
            _ => "->>",
        };
        format!(
            "data{operator}{} AS {}",
            quote_literal(&self.name),
            quote_ident(&snake_name(&self.name))
        )
    }
}

/// Schema of one typed object table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedObjectSpec {
    /// Logical table name, `lo_` prefixed
    pub table: String,

    /// Object type name looked up within the tenant
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl TypedObjectSpec {
    /// SELECT over `objects` for the given type, or one matching nothing
    pub fn select_sql(&self, type_id: Option<Uuid>) -> String {
        let mut columns = vec!["id AS lo_id".to_string()];
        columns.extend(self.attributes.iter().map(Attribute::projection));
        let filter = match type_id {
            Some(id) => format!("type_id = '{id}' AND deleted_at IS NULL"),
            None => "false".to_string(),
        };
        format!("SELECT {} FROM objects WHERE {filter}", columns.join(", "))
    }
}

/// Builder for a typed object table
#[derive(Debug, Clone)]
pub struct TypedObjectTable {
    spec: TypedObjectSpec,
}

impl TypedObjectTable {
    pub fn new(spec: TypedObjectSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &TypedObjectSpec {
        &self.spec
    }
}

impl QueryBuilder for TypedObjectTable {
    fn build(&self, ctx: &BuildContext) -> String {
        let type_id = ctx.object_types.get(&self.spec.type_name).copied();
        self.spec.select_sql(type_id)
    }

    fn dependency(&self) -> &str {
        TYPED_OBJECT_DEPENDENCY
    }
}

/// `First Name` → `first_name`
pub fn snake_name(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}

/// Specs shipped with the crate
pub fn builtin_specs() -> Result<Vec<TypedObjectSpec>> {
    parse_specs(BUILTIN_SPECS)
}

/// Load specs from a YAML file
pub fn load_specs(path: impl AsRef<Path>) -> Result<Vec<TypedObjectSpec>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_specs(&content)
}

pub fn parse_specs(content: &str) -> Result<Vec<TypedObjectSpec>> {
    let specs: Vec<TypedObjectSpec> = serde_yaml::from_str(content)
        .map_err(|e| Error::config(format!("invalid typed object specs: {e}")))?;

    for spec in &specs {
        if !spec.table.starts_with("lo_") {
            return Err(Error::config(format!(
                "typed object table {} must start with lo_",
                spec.table
            )));
        }
    }
    Ok(specs)
}
