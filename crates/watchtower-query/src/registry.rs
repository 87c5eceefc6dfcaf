//! Logical table registry
//!
//! Maps the table names monitor authors write (`policies`, `lo_users`, ...)
//! to builders producing the tenant-scoped SELECT that replaces them.

use crate::typed_objects::{self, TypedObjectSpec, TypedObjectTable};
use crate::vendor;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use watchtower_core::{CloudVendor, Error, ObjectType, Result, TenantId};

/// Set-returning functions allowed in FROM lists
pub const SAFE_FUNCTIONS: &[&str] = &["jsonb_array_elements", "jsonb_array_elements_text"];

/// Everything a builder may need to know about the tenant
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub tenant: TenantId,

    /// Tenant object types keyed by type name
    pub object_types: HashMap<String, Uuid>,
}

impl BuildContext {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            object_types: HashMap::new(),
        }
    }

    pub fn with_object_types(mut self, types: impl IntoIterator<Item = ObjectType>) -> Self {
        self.object_types.extend(
            types
                .into_iter()
                .filter(|t| t.tenant == self.tenant)
                .map(|t| (t.type_name, t.id)),
        );
        self
    }
}

/// Produces the concrete query standing in for a logical table
pub trait QueryBuilder: Send + Sync {
    /// Concrete SELECT for the tenant in `ctx`
    fn build(&self, ctx: &BuildContext) -> String;

    /// Dependency tag refreshed when the underlying data changes
    fn dependency(&self) -> &str;
}

/// An application table backed by a fixed SQL template.
///
/// `{tenant}` in the template is replaced by the tenant id.
#[derive(Debug, Clone)]
pub struct ApplicationTable {
    pub name: &'static str,
    pub dependency: &'static str,
    pub template: &'static str,
}

impl QueryBuilder for ApplicationTable {
    fn build(&self, ctx: &BuildContext) -> String {
        self.template.replace("{tenant}", &ctx.tenant.to_string())
    }

    fn dependency(&self) -> &str {
        self.dependency
    }
}

/// How a FROM-list name is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Logical,
    Cloud(CloudVendor),
}

/// Process-wide, read-only map of logical tables
#[derive(Clone)]
pub struct Registry {
    tables: BTreeMap<String, Arc<dyn QueryBuilder>>,
    safe_functions: BTreeSet<String>,
}

impl Registry {
    /// An empty registry that still knows the safe functions
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            safe_functions: SAFE_FUNCTIONS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Application tables plus the built-in typed object tables
    pub fn builtin() -> Result<Self> {
        Ok(Self::with_typed_objects(typed_objects::builtin_specs()?))
    }

    /// Application tables plus the given typed object tables
    pub fn with_typed_objects(specs: Vec<TypedObjectSpec>) -> Self {
        let mut registry = Self::new();
        for table in APPLICATION_TABLES {
            registry.register(table.name, Arc::new(table.clone()));
        }
        for spec in specs {
            let name = spec.table.clone();
            registry.register(&name, Arc::new(TypedObjectTable::new(spec)));
        }
        debug!(tables = registry.len(), "Logical table registry initialised");
        registry
    }

    pub fn register(&mut self, name: &str, builder: Arc<dyn QueryBuilder>) {
        self.tables.insert(name.to_ascii_lowercase(), builder);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn QueryBuilder>> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Concrete SQL for a logical table
    pub fn build(&self, name: &str, ctx: &BuildContext) -> Result<String> {
        self.get(name)
            .map(|builder| builder.build(ctx))
            .ok_or_else(|| Error::unknown_table(name))
    }

    pub fn is_safe_function(&self, name: &str) -> bool {
        self.safe_functions.contains(&name.to_ascii_lowercase())
    }

    /// Whether `name` is a logical table or a cloud vendor table
    pub fn classify(&self, name: &str) -> Option<TableKind> {
        if self.contains(name) {
            Some(TableKind::Logical)
        } else {
            vendor::vendor_of_table(name).map(TableKind::Cloud)
        }
    }

    /// Dependency tag for a FROM-list table
    pub fn dependency_of(&self, name: &str) -> Option<String> {
        match self.classify(name)? {
            TableKind::Logical => self.get(name).map(|b| b.dependency().to_string()),
            TableKind::Cloud(vendor) => Some(vendor::dependency_tag(vendor)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("safe_functions", &self.safe_functions)
            .finish()
    }
}

const APPLICATION_TABLES: &[ApplicationTable] = &[
    ApplicationTable {
        name: "policies",
        dependency: "policies_dependency",
        template: "SELECT p.id, p.display_id, p.name, p.category, p.description, \
                   p.is_published, p.is_required, p.owner_id, p.approver_id, \
                   p.administrator_id, p.published_at, p.next_review_date, \
                   p.created_at, p.updated_at \
                   FROM policy_policy p \
                   WHERE p.organization_id = '{tenant}' AND p.deleted_at IS NULL",
    },
    ApplicationTable {
        name: "people",
        dependency: "people_dependency",
        template: "SELECT u.id, u.email, u.first_name, u.last_name, u.title, u.role, \
                   u.is_active, u.manager_id, u.employment_status, u.start_date, \
                   u.end_date, u.last_login, u.policies_reviewed, u.security_training, \
                   u.created_at, u.updated_at \
                   FROM user_user u \
                   WHERE u.organization_id = '{tenant}' AND u.deleted_at IS NULL",
    },
    ApplicationTable {
        name: "monitors",
        dependency: "monitors_dependency",
        template: "SELECT tm.id AS monitor_id, m.display_id, \
                   COALESCE(tm.name, m.name) AS name, \
                   COALESCE(tm.description, m.description) AS description, \
                   tm.status, COALESCE(tm.urgency, m.urgency) AS urgency, tm.active, \
                   m.health_condition, m.kind, tm.created_at, tm.updated_at \
                   FROM tenant_monitor tm JOIN monitor m ON m.id = tm.monitor_id \
                   WHERE tm.tenant_id = '{tenant}'",
    },
    ApplicationTable {
        name: "monitor_results",
        dependency: "monitor_results_dependency",
        template: "SELECT r.id, r.tenant_monitor_id AS monitor_id, r.status, \
                   r.health_condition, r.execution_time, r.created_at \
                   FROM monitor_result r JOIN tenant_monitor tm ON tm.id = r.tenant_monitor_id \
                   WHERE tm.tenant_id = '{tenant}'",
    },
    ApplicationTable {
        name: "documents",
        dependency: "documents_dependency",
        template: "SELECT e.id, e.name, e.description, e.type, e.owner_id, \
                   e.evidence_date, e.expiration_date, e.created_at, e.updated_at \
                   FROM evidence_evidence e \
                   WHERE e.organization_id = '{tenant}' AND e.deleted_at IS NULL",
    },
    ApplicationTable {
        name: "controls",
        dependency: "controls_dependency",
        template: "SELECT c.id, c.display_id, c.name, c.description, c.status, \
                   c.owner_id, c.framework_tag, c.implementation_notes, \
                   c.created_at, c.updated_at \
                   FROM control_control c \
                   WHERE c.organization_id = '{tenant}' AND c.deleted_at IS NULL",
    },
    ApplicationTable {
        name: "evidence_requests",
        dependency: "evidence_requests_dependency",
        template: "SELECT er.id, er.display_id, er.name, er.description, er.status, \
                   er.assignee_id, er.update_frequency, er.last_submitted_at, \
                   er.created_at, er.updated_at \
                   FROM evidence_evidencerequest er \
                   WHERE er.organization_id = '{tenant}' AND er.deleted_at IS NULL",
    },
    ApplicationTable {
        name: "vendors",
        dependency: "vendors_dependency",
        template: "SELECT v.id, v.name, v.website, v.risk_rating, v.status, \
                   v.internal_stakeholder_id, v.contract_start_date, \
                   v.contract_renewal_date, v.created_at, v.updated_at \
                   FROM vendor_vendor v \
                   WHERE v.organization_id = '{tenant}' AND v.deleted_at IS NULL",
    },
    ApplicationTable {
        name: "audits",
        dependency: "audits_dependency",
        template: "SELECT a.id, a.name, a.audit_type, a.audit_framework, \
                   a.completion_percentage, a.start_date, a.end_date, a.completed_at, \
                   a.created_at \
                   FROM audit_audit a \
                   WHERE a.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "teams",
        dependency: "teams_dependency",
        template: "SELECT t.id, t.name, t.description, t.charter, t.created_at \
                   FROM organization_team t \
                   WHERE t.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "officers",
        dependency: "officers_dependency",
        template: "SELECT o.id, o.name, o.description, o.user_id, o.created_at \
                   FROM organization_officer o \
                   WHERE o.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "team_members",
        dependency: "teams_dependency",
        template: "SELECT tm.id, tm.team_id, tm.user_id, tm.role, tm.phone, tm.created_at \
                   FROM organization_teammember tm JOIN organization_team t ON t.id = tm.team_id \
                   WHERE t.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "training_alumni",
        dependency: "training_dependency",
        template: "SELECT ta.id, ta.user_id, ta.training_id, ta.completed_at \
                   FROM training_alumni ta JOIN training_training t ON t.id = ta.training_id \
                   WHERE t.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "trainings",
        dependency: "training_dependency",
        template: "SELECT t.id, t.name, t.category, t.description, t.roles, t.created_at \
                   FROM training_training t \
                   WHERE t.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "action_items",
        dependency: "action_items_dependency",
        template: "SELECT ai.id, ai.name, ai.description, ai.status, ai.due_date, \
                   ai.completion_date, ai.assignee_id, ai.is_required, ai.is_recurrent, \
                   ai.recurrent_schedule, ai.created_at \
                   FROM action_item_actionitem ai \
                   WHERE ai.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "tasks",
        dependency: "tasks_dependency",
        template: "SELECT t.id, t.name, t.description, t.program_id, t.tier, t.created_at \
                   FROM program_task t \
                   WHERE t.organization_id = '{tenant}'",
    },
    ApplicationTable {
        name: "subtasks",
        dependency: "tasks_dependency",
        template: "SELECT s.id, s.name, s.task_id, s.assignee_id, s.status, s.due_date, \
                   s.completed_at, s.is_required, s.created_at \
                   FROM program_subtask s JOIN program_task t ON t.id = s.task_id \
                   WHERE t.organization_id = '{tenant}'",
    },
];
