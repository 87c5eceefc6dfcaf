//! PostgreSQL store

use crate::store::{
    ActionItemStore, EvaluationGuard, EvaluationLock, EvaluationRecord, ExclusionChange,
    ExclusionStore, Liveness, MonitorStore, ResultStore, ResultUpdate, TenantStore,
    UserEventStore, WatcherStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use watchtower_core::{
    ActionItem, Error, Exclusion, ExclusionEvent, ExclusionId, Monitor, MonitorId, MonitorResult,
    ObjectType, Result, SubscriptionEvent, Tenant, TenantId, TenantMonitor, TenantMonitorId,
    User, UserId, UserMonitorEvent, WatcherList,
};

const SCHEMA: &str = include_str!("../migrations/0001_watchtower.sql");

const ENSURE_WATCHER_LIST: &str =
    "INSERT INTO watcher_list (tenant_monitor_id) VALUES ($1) ON CONFLICT DO NOTHING";

/// Operations slower than this are logged
const SLOW_OPERATION: Duration = Duration::from_millis(100);

/// Connection pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,

    /// Separate connections that hold evaluation locks, one per concurrent
    /// evaluation
    pub lock_connections: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            lock_connections: 5,
        }
    }
}

/// Open a pool against `database_url`
pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    if config.max_connections == 0 || config.max_connections < config.min_connections {
        return Err(Error::config(
            "max_connections must be >= min_connections and > 0",
        ));
    }

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
    if let Some(idle) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle));
    }

    options.connect(database_url).await.map_err(db_error)
}

/// Map a driver error; unique violations become conflicts
pub fn db_error(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            Error::conflict(db.message().to_string())
        }
        _ => Error::database(err.to_string()),
    }
}

/// Enum columns are stored as their serde name
fn encode<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(Error::internal(format!("expected a unit variant, got {other}"))),
    }
}

fn decode<T: DeserializeOwned>(text: String) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(text))?)
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(db_error)
}

fn check_found(affected: u64, entity: &'static str, id: Uuid) -> Result<()> {
    if affected == 0 {
        return Err(Error::not_found(entity, id));
    }
    Ok(())
}

/// Commit on success, roll back on error
async fn finish<T>(tx: Transaction<'_, Postgres>, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await.map_err(db_error)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}

fn log_if_slow(operation: &'static str, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed > SLOW_OPERATION {
        warn!(
            operation,
            duration_ms = elapsed.as_millis() as u64,
            "Slow database operation detected"
        );
    }
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant> {
    Ok(Tenant {
        id: col(row, "id")?,
        name: col(row, "name")?,
        active: col(row, "active")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: col(row, "id")?,
        tenant: col(row, "tenant_id")?,
        email: col(row, "email")?,
        role: col(row, "role")?,
        active: col(row, "active")?,
    })
}

fn monitor_from_row(row: &PgRow) -> Result<Monitor> {
    Ok(Monitor {
        id: col(row, "id")?,
        name: col(row, "name")?,
        display_id: col(row, "display_id")?,
        description: col(row, "description")?,
        query: col(row, "query")?,
        validation_query: col(row, "validation_query")?,
        health_condition: decode(col(row, "health_condition")?)?,
        urgency: decode(col(row, "urgency")?)?,
        frequency: decode(col(row, "frequency")?)?,
        kind: decode(col(row, "kind")?)?,
        owner: col(row, "owner_id")?,
        parent_monitor: col(row, "parent_monitor_id")?,
        fix_me_link: col(row, "fix_me_link")?,
        exclude_field: col(row, "exclude_field")?,
        control_refs: col::<Json<_>>(row, "control_refs")?.0,
        tag_refs: col::<Json<_>>(row, "tag_refs")?.0,
        subtask_refs: col::<Json<_>>(row, "subtask_refs")?.0,
        source_systems: col::<Json<_>>(row, "source_systems")?.0,
        context: col::<Json<_>>(row, "context")?.0,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn tenant_monitor_from_row(row: &PgRow) -> Result<TenantMonitor> {
    let urgency: Option<String> = col(row, "urgency")?;
    Ok(TenantMonitor {
        id: col(row, "id")?,
        tenant: col(row, "tenant_id")?,
        monitor: col(row, "monitor_id")?,
        active: col(row, "active")?,
        toggled_by_system: col(row, "toggled_by_system")?,
        name: col(row, "name")?,
        description: col(row, "description")?,
        query: col(row, "query")?,
        status: decode(col(row, "status")?)?,
        urgency: urgency.map(decode).transpose()?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<MonitorResult> {
    Ok(MonitorResult {
        id: col(row, "id")?,
        created_at: col(row, "created_at")?,
        tenant_monitor: col(row, "tenant_monitor_id")?,
        status: decode(col(row, "status")?)?,
        health_condition: decode(col(row, "health_condition")?)?,
        query: col(row, "query")?,
        execution_time: col(row, "execution_time")?,
        user: col(row, "user_id")?,
        data: col::<Json<_>>(row, "result")?.0,
    })
}

fn exclusion_from_row(row: &PgRow) -> Result<Exclusion> {
    Ok(Exclusion {
        id: col(row, "id")?,
        tenant_monitor: col(row, "tenant_monitor_id")?,
        exclusion_date: col(row, "exclusion_date")?,
        is_active: col(row, "is_active")?,
        key: col(row, "key")?,
        value: col(row, "value")?,
        justification: col(row, "justification")?,
        snapshot: col::<Json<_>>(row, "snapshot")?.0,
    })
}

fn exclusion_event_from_row(row: &PgRow) -> Result<ExclusionEvent> {
    Ok(ExclusionEvent {
        id: col(row, "id")?,
        exclusion: col(row, "exclusion_id")?,
        event_date: col(row, "event_date")?,
        event_type: decode(col(row, "event_type")?)?,
        justification: col(row, "justification")?,
        user: col(row, "user_id")?,
    })
}

fn action_item_from_row(row: &PgRow) -> Result<ActionItem> {
    Ok(ActionItem {
        id: col(row, "id")?,
        assignee: col(row, "assignee_id")?,
        tenant_monitor: col(row, "tenant_monitor_id")?,
        status: decode(col(row, "status")?)?,
        due_date: col(row, "due_date")?,
        description: col(row, "description")?,
        reference_url: col(row, "reference_url")?,
        created_at: col(row, "created_at")?,
        completed_at: col(row, "completed_at")?,
    })
}

async fn write_exclusion_change(
    tx: &mut Transaction<'_, Postgres>,
    change: &ExclusionChange,
) -> Result<()> {
    let exclusion = &change.exclusion;
    sqlx::query(
        "INSERT INTO monitor_exclusion \
         (id, tenant_monitor_id, exclusion_date, is_active, key, value, justification, snapshot) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (id) DO UPDATE SET \
         exclusion_date = EXCLUDED.exclusion_date, is_active = EXCLUDED.is_active, \
         justification = EXCLUDED.justification, snapshot = EXCLUDED.snapshot",
    )
    .bind(exclusion.id)
    .bind(exclusion.tenant_monitor)
    .bind(exclusion.exclusion_date)
    .bind(exclusion.is_active)
    .bind(&exclusion.key)
    .bind(&exclusion.value)
    .bind(&exclusion.justification)
    .bind(Json(&exclusion.snapshot))
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;

    write_exclusion_event(tx, &change.event).await
}

async fn write_exclusion_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &ExclusionEvent,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO monitor_exclusion_event \
         (id, exclusion_id, event_date, event_type, justification, user_id) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(event.id)
    .bind(event.exclusion)
    .bind(event.event_date)
    .bind(encode(&event.event_type)?)
    .bind(&event.justification)
    .bind(event.user)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn write_monitor(
    tx: &mut Transaction<'_, Postgres>,
    monitor: &Monitor,
    changes: &[ExclusionChange],
) -> Result<()> {
    let affected = sqlx::query(
        "UPDATE monitor SET name = $2, display_id = $3, description = $4, \
         query = $5, validation_query = $6, health_condition = $7, urgency = $8, \
         frequency = $9, kind = $10, owner_id = $11, parent_monitor_id = $12, \
         fix_me_link = $13, exclude_field = $14, control_refs = $15, tag_refs = $16, \
         subtask_refs = $17, source_systems = $18, context = $19, updated_at = $20 \
         WHERE id = $1",
    )
    .bind(monitor.id)
    .bind(&monitor.name)
    .bind(&monitor.display_id)
    .bind(&monitor.description)
    .bind(&monitor.query)
    .bind(&monitor.validation_query)
    .bind(encode(&monitor.health_condition)?)
    .bind(encode(&monitor.urgency)?)
    .bind(encode(&monitor.frequency)?)
    .bind(encode(&monitor.kind)?)
    .bind(monitor.owner)
    .bind(monitor.parent_monitor)
    .bind(&monitor.fix_me_link)
    .bind(&monitor.exclude_field)
    .bind(Json(&monitor.control_refs))
    .bind(Json(&monitor.tag_refs))
    .bind(Json(&monitor.subtask_refs))
    .bind(Json(&monitor.source_systems))
    .bind(Json(&monitor.context))
    .bind(monitor.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?
    .rows_affected();
    check_found(affected, "monitor", monitor.id)?;

    for change in changes {
        write_exclusion_change(tx, change).await?;
    }
    Ok(())
}

async fn write_tenant_monitor(
    tx: &mut Transaction<'_, Postgres>,
    tm: &TenantMonitor,
    changes: &[ExclusionChange],
) -> Result<()> {
    let urgency = tm.urgency.as_ref().map(encode).transpose()?;
    let affected = sqlx::query(
        "UPDATE tenant_monitor SET active = $2, toggled_by_system = $3, \
         name = $4, description = $5, query = $6, status = $7, urgency = $8, updated_at = $9 \
         WHERE id = $1",
    )
    .bind(tm.id)
    .bind(tm.active)
    .bind(tm.toggled_by_system)
    .bind(&tm.name)
    .bind(&tm.description)
    .bind(&tm.query)
    .bind(encode(&tm.status)?)
    .bind(urgency)
    .bind(tm.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?
    .rows_affected();
    check_found(affected, "tenant monitor", tm.id)?;

    for change in changes {
        write_exclusion_change(tx, change).await?;
    }
    Ok(())
}

async fn write_evaluation(
    tx: &mut Transaction<'_, Postgres>,
    record: &EvaluationRecord,
) -> Result<()> {
    let result = &record.result;
    sqlx::query(
        "INSERT INTO monitor_result \
         (id, created_at, tenant_monitor_id, status, health_condition, query, \
          execution_time, user_id, result) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(result.id)
    .bind(result.created_at)
    .bind(result.tenant_monitor)
    .bind(encode(&result.status)?)
    .bind(encode(&result.health_condition)?)
    .bind(&result.query)
    .bind(result.execution_time)
    .bind(result.user)
    .bind(Json(&result.data))
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;

    let affected = sqlx::query(
        "UPDATE tenant_monitor SET status = $2, updated_at = $3 WHERE id = $1",
    )
    .bind(result.tenant_monitor)
    .bind(encode(&result.status)?)
    .bind(result.created_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?
    .rows_affected();
    check_found(affected, "tenant monitor", result.tenant_monitor)?;

    for event in &record.exclusion_events {
        write_exclusion_event(tx, event).await?;
    }
    Ok(())
}

async fn write_result_update(
    tx: &mut Transaction<'_, Postgres>,
    update: &ResultUpdate,
) -> Result<()> {
    let affected = sqlx::query(
        "UPDATE monitor_result SET status = $3, result = $4 \
         WHERE id = $1 AND tenant_monitor_id = $2",
    )
    .bind(update.result)
    .bind(update.tenant_monitor)
    .bind(encode(&update.status)?)
    .bind(Json(&update.data))
    .execute(&mut **tx)
    .await
    .map_err(db_error)?
    .rows_affected();
    check_found(affected, "monitor result", update.result)?;

    sqlx::query("UPDATE tenant_monitor SET status = $2 WHERE id = $1")
        .bind(update.tenant_monitor)
        .bind(encode(&update.status)?)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
    Ok(())
}

/// Advisory-lock key of a tenant monitor
fn lock_key(tenant_monitor: TenantMonitorId) -> i64 {
    let (high, low) = tenant_monitor.as_u64_pair();
    (high ^ low) as i64
}

/// Store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,

    /// Connections pinned by held evaluation locks
    locks: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool, locks: PgPool) -> Self {
        Self { pool, locks }
    }

    /// Open the store pool and a lazily connected lock pool
    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<Self> {
        if config.lock_connections == 0 {
            return Err(Error::config("lock_connections must be > 0"));
        }
        let pool = connect(database_url, config).await?;
        let locks = PgPoolOptions::new()
            .max_connections(config.lock_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(database_url)
            .map_err(db_error)?;
        Ok(Self::new(pool, locks))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it is missing
    pub async fn migrate(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await.map_err(db_error)?;
        info!("Database schema is up to date");
        Ok(())
    }

    async fn fetch_all<T>(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        map: fn(&PgRow) -> Result<T>,
    ) -> Result<Vec<T>> {
        query
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?
            .iter()
            .map(map)
            .collect()
    }

    async fn fetch_optional<T>(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        map: fn(&PgRow) -> Result<T>,
    ) -> Result<Option<T>> {
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .as_ref()
            .map(map)
            .transpose()
    }
}

#[async_trait]
impl TenantStore for PgStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            "INSERT INTO watchtower_tenant (id, name, active) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, active = EXCLUDED.active",
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant.active)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Tenant> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM watchtower_tenant WHERE id = $1").bind(id),
            tenant_from_row,
        )
        .await?
        .ok_or_else(|| Error::not_found("tenant", id))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM watchtower_tenant ORDER BY name"),
            tenant_from_row,
        )
        .await
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO watchtower_user (id, tenant_id, email, role, active) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email, role = EXCLUDED.role, \
             active = EXCLUDED.active",
        )
        .bind(user.id)
        .bind(user.tenant)
        .bind(&user.email)
        .bind(&user.role)
        .bind(user.active)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<User> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM watchtower_user WHERE id = $1").bind(id),
            user_from_row,
        )
        .await?
        .ok_or_else(|| Error::not_found("user", id))
    }

    async fn list_users(&self, tenant: TenantId) -> Result<Vec<User>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM watchtower_user WHERE tenant_id = $1 ORDER BY email")
                .bind(tenant),
            user_from_row,
        )
        .await
    }

    async fn upsert_object_type(&self, object_type: &ObjectType) -> Result<()> {
        sqlx::query(
            "INSERT INTO watchtower_object_type (id, tenant_id, type_name) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET type_name = EXCLUDED.type_name",
        )
        .bind(object_type.id)
        .bind(object_type.tenant)
        .bind(&object_type.type_name)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list_object_types(&self, tenant: TenantId) -> Result<Vec<ObjectType>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM watchtower_object_type WHERE tenant_id = $1").bind(tenant),
            |row| {
                Ok(ObjectType {
                    id: col(row, "id")?,
                    tenant: col(row, "tenant_id")?,
                    type_name: col(row, "type_name")?,
                })
            },
        )
        .await
    }
}

#[async_trait]
impl MonitorStore for PgStore {
    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()> {
        monitor.check_invariants()?;
        sqlx::query(
            "INSERT INTO monitor \
             (id, name, display_id, description, query, validation_query, health_condition, \
              urgency, frequency, kind, owner_id, parent_monitor_id, fix_me_link, \
              exclude_field, control_refs, tag_refs, subtask_refs, source_systems, context, \
              created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21)",
        )
        .bind(monitor.id)
        .bind(&monitor.name)
        .bind(&monitor.display_id)
        .bind(&monitor.description)
        .bind(&monitor.query)
        .bind(&monitor.validation_query)
        .bind(encode(&monitor.health_condition)?)
        .bind(encode(&monitor.urgency)?)
        .bind(encode(&monitor.frequency)?)
        .bind(encode(&monitor.kind)?)
        .bind(monitor.owner)
        .bind(monitor.parent_monitor)
        .bind(&monitor.fix_me_link)
        .bind(&monitor.exclude_field)
        .bind(Json(&monitor.control_refs))
        .bind(Json(&monitor.tag_refs))
        .bind(Json(&monitor.subtask_refs))
        .bind(Json(&monitor.source_systems))
        .bind(Json(&monitor.context))
        .bind(monitor.created_at)
        .bind(monitor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_monitor(&self, monitor: &Monitor, changes: &[ExclusionChange]) -> Result<()> {
        monitor.check_invariants()?;
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let outcome = write_monitor(&mut tx, monitor, changes).await;
        let outcome = finish(tx, outcome).await;
        log_if_slow("update_monitor", started);
        outcome
    }

    async fn get_monitor(&self, id: MonitorId) -> Result<Monitor> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM monitor WHERE id = $1").bind(id),
            monitor_from_row,
        )
        .await?
        .ok_or_else(|| Error::not_found("monitor", id))
    }

    async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM monitor ORDER BY created_at"),
            monitor_from_row,
        )
        .await
    }

    async fn monitor_children(&self, parent: MonitorId) -> Result<Vec<Monitor>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM monitor WHERE parent_monitor_id = $1")
                .bind(parent),
            monitor_from_row,
        )
        .await
    }

    async fn insert_tenant_monitor(&self, tm: &TenantMonitor) -> Result<()> {
        let urgency = tm.urgency.as_ref().map(encode).transpose()?;
        sqlx::query(
            "INSERT INTO tenant_monitor \
             (id, tenant_id, monitor_id, active, toggled_by_system, name, description, query, \
              status, urgency, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(tm.id)
        .bind(tm.tenant)
        .bind(tm.monitor)
        .bind(tm.active)
        .bind(tm.toggled_by_system)
        .bind(&tm.name)
        .bind(&tm.description)
        .bind(&tm.query)
        .bind(encode(&tm.status)?)
        .bind(urgency)
        .bind(tm.created_at)
        .bind(tm.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_tenant_monitor(
        &self,
        tm: &TenantMonitor,
        changes: &[ExclusionChange],
    ) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let outcome = write_tenant_monitor(&mut tx, tm, changes).await;
        let outcome = finish(tx, outcome).await;
        log_if_slow("update_tenant_monitor", started);
        outcome
    }

    async fn get_tenant_monitor(&self, id: TenantMonitorId) -> Result<TenantMonitor> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM tenant_monitor WHERE id = $1").bind(id),
            tenant_monitor_from_row,
        )
        .await?
        .ok_or_else(|| Error::not_found("tenant monitor", id))
    }

    async fn find_tenant_monitor(
        &self,
        tenant: TenantId,
        monitor: MonitorId,
    ) -> Result<Option<TenantMonitor>> {
        self.fetch_optional(
            sqlx::query(
                "SELECT * FROM tenant_monitor WHERE tenant_id = $1 AND monitor_id = $2",
            )
            .bind(tenant)
            .bind(monitor),
            tenant_monitor_from_row,
        )
        .await
    }

    async fn list_tenant_monitors(&self, tenant: TenantId) -> Result<Vec<TenantMonitor>> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM tenant_monitor WHERE tenant_id = $1 ORDER BY created_at",
            )
            .bind(tenant),
            tenant_monitor_from_row,
        )
        .await
    }

    async fn tenant_monitors_for_monitor(&self, monitor: MonitorId) -> Result<Vec<TenantMonitor>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM tenant_monitor WHERE monitor_id = $1")
                .bind(monitor),
            tenant_monitor_from_row,
        )
        .await
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn persist_evaluation(&self, record: &EvaluationRecord) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let outcome = write_evaluation(&mut tx, record).await;
        let outcome = finish(tx, outcome).await;
        log_if_slow("persist_evaluation", started);
        if outcome.is_ok() {
            debug!(
                tenant_monitor = %record.result.tenant_monitor,
                status = %record.result.status,
                "Persisted evaluation"
            );
        }
        outcome
    }

    async fn latest_result(&self, tenant_monitor: TenantMonitorId) -> Result<Option<MonitorResult>> {
        self.fetch_optional(
            sqlx::query(
                "SELECT * FROM monitor_result WHERE tenant_monitor_id = $1 \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(tenant_monitor),
            result_from_row,
        )
        .await
    }

    async fn results_between(
        &self,
        tenant_monitor: TenantMonitorId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MonitorResult>> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM monitor_result WHERE tenant_monitor_id = $1 \
                 AND created_at >= $2 AND created_at <= $3 ORDER BY created_at",
            )
            .bind(tenant_monitor)
            .bind(start)
            .bind(end),
            result_from_row,
        )
        .await
    }

    async fn result_before(
        &self,
        tenant_monitor: TenantMonitorId,
        at: DateTime<Utc>,
    ) -> Result<Option<MonitorResult>> {
        self.fetch_optional(
            sqlx::query(
                "SELECT * FROM monitor_result WHERE tenant_monitor_id = $1 \
                 AND created_at < $2 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(tenant_monitor)
            .bind(at),
            result_from_row,
        )
        .await
    }
}

#[async_trait]
impl ExclusionStore for PgStore {
    async fn get_exclusion(&self, id: ExclusionId) -> Result<Exclusion> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM monitor_exclusion WHERE id = $1").bind(id),
            exclusion_from_row,
        )
        .await?
        .ok_or_else(|| Error::not_found("exclusion", id))
    }

    async fn list_exclusions(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<Exclusion>> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM monitor_exclusion WHERE tenant_monitor_id = $1 \
                 ORDER BY exclusion_date",
            )
            .bind(tenant_monitor),
            exclusion_from_row,
        )
        .await
    }

    async fn active_exclusions(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<Exclusion>> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM monitor_exclusion WHERE tenant_monitor_id = $1 AND is_active \
                 ORDER BY exclusion_date",
            )
            .bind(tenant_monitor),
            exclusion_from_row,
        )
        .await
    }

    async fn exclusion_events(&self, exclusion: ExclusionId) -> Result<Vec<ExclusionEvent>> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM monitor_exclusion_event WHERE exclusion_id = $1 \
                 ORDER BY event_date",
            )
            .bind(exclusion),
            exclusion_event_from_row,
        )
        .await
    }

    async fn apply_exclusion_change(
        &self,
        change: &ExclusionChange,
        result: Option<&ResultUpdate>,
    ) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let outcome = async {
            write_exclusion_change(&mut tx, change).await?;
            if let Some(update) = result {
                write_result_update(&mut tx, update).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        let outcome = finish(tx, outcome).await;
        log_if_slow("apply_exclusion_change", started);
        outcome
    }

    async fn append_exclusion_event(&self, event: &ExclusionEvent) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let outcome = write_exclusion_event(&mut tx, event).await;
        finish(tx, outcome).await
    }

    async fn purge_exclusions(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = sqlx::query(
            "DELETE FROM monitor_exclusion e WHERE NOT e.is_active AND COALESCE( \
             (SELECT max(ev.event_date) FROM monitor_exclusion_event ev \
              WHERE ev.exclusion_id = e.id), e.exclusion_date) < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();
        Ok(affected as usize)
    }
}

#[async_trait]
impl WatcherStore for PgStore {
    async fn watchers(&self, tenant_monitor: TenantMonitorId) -> Result<WatcherList> {
        let users = self
            .fetch_all(
                sqlx::query("SELECT user_id FROM watcher_list_users WHERE tenant_monitor_id = $1")
                    .bind(tenant_monitor),
                |row| col::<Uuid>(row, "user_id"),
            )
            .await?;
        Ok(WatcherList {
            tenant_monitor,
            users: users.into_iter().collect(),
        })
    }

    async fn set_watchers(&self, list: &WatcherList) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let outcome = async {
            sqlx::query(ENSURE_WATCHER_LIST)
                .bind(list.tenant_monitor)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            sqlx::query("DELETE FROM watcher_list_users WHERE tenant_monitor_id = $1")
                .bind(list.tenant_monitor)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            for user in &list.users {
                sqlx::query(
                    "INSERT INTO watcher_list_users (tenant_monitor_id, user_id) VALUES ($1, $2)",
                )
                .bind(list.tenant_monitor)
                .bind(user)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
            Ok::<(), Error>(())
        }
        .await;
        finish(tx, outcome).await
    }

    async fn add_watcher(&self, tenant_monitor: TenantMonitorId, user: UserId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let outcome = async {
            sqlx::query(ENSURE_WATCHER_LIST)
                .bind(tenant_monitor)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            let affected = sqlx::query(
                "INSERT INTO watcher_list_users (tenant_monitor_id, user_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(tenant_monitor)
            .bind(user)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();
            Ok::<bool, Error>(affected == 1)
        }
        .await;
        finish(tx, outcome).await
    }

    async fn remove_watcher(&self, tenant_monitor: TenantMonitorId, user: UserId) -> Result<bool> {
        let affected = sqlx::query(
            "DELETE FROM watcher_list_users WHERE tenant_monitor_id = $1 AND user_id = $2",
        )
        .bind(tenant_monitor)
        .bind(user)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();
        Ok(affected == 1)
    }

    async fn record_subscription(&self, event: &SubscriptionEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO monitor_subscription_event (tenant_id, user_id, event, at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(event.tenant)
        .bind(event.user)
        .bind(encode(&event.event)?)
        .bind(event.at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn subscription_events(&self, tenant: TenantId) -> Result<Vec<SubscriptionEvent>> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM monitor_subscription_event WHERE tenant_id = $1 \
                 ORDER BY at, id",
            )
            .bind(tenant),
            |row| {
                Ok(SubscriptionEvent {
                    tenant: col(row, "tenant_id")?,
                    user: col(row, "user_id")?,
                    event: decode(col(row, "event")?)?,
                    at: col(row, "at")?,
                })
            },
        )
        .await
    }
}

#[async_trait]
impl ActionItemStore for PgStore {
    async fn action_items(&self, tenant_monitor: TenantMonitorId) -> Result<Vec<ActionItem>> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM watchtower_action_item WHERE tenant_monitor_id = $1 \
                 ORDER BY created_at",
            )
            .bind(tenant_monitor),
            action_item_from_row,
        )
        .await
    }

    async fn insert_action_item(&self, item: &ActionItem) -> Result<bool> {
        let affected = sqlx::query(
            "INSERT INTO watchtower_action_item \
             (id, assignee_id, tenant_monitor_id, status, due_date, description, \
              reference_url, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT DO NOTHING",
        )
        .bind(item.id)
        .bind(item.assignee)
        .bind(item.tenant_monitor)
        .bind(encode(&item.status)?)
        .bind(item.due_date)
        .bind(&item.description)
        .bind(&item.reference_url)
        .bind(item.created_at)
        .bind(item.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();
        Ok(affected == 1)
    }

    async fn update_action_item(&self, item: &ActionItem) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE watchtower_action_item SET assignee_id = $2, status = $3, due_date = $4, \
             description = $5, reference_url = $6, completed_at = $7 WHERE id = $1",
        )
        .bind(item.id)
        .bind(item.assignee)
        .bind(encode(&item.status)?)
        .bind(item.due_date)
        .bind(&item.description)
        .bind(&item.reference_url)
        .bind(item.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();
        check_found(affected, "action item", item.id)
    }

    async fn delete_action_items(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let affected = sqlx::query("DELETE FROM watchtower_action_item WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(db_error)?
            .rows_affected();
        Ok(affected as usize)
    }
}

#[async_trait]
impl UserEventStore for PgStore {
    async fn record_user_event(&self, event: &UserMonitorEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO monitor_user_event (user_id, tenant_monitor_id, event, at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(event.user)
        .bind(event.tenant_monitor)
        .bind(encode(&event.event)?)
        .bind(event.at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn user_events(&self, user: UserId) -> Result<Vec<UserMonitorEvent>> {
        self.fetch_all(
            sqlx::query("SELECT * FROM monitor_user_event WHERE user_id = $1 ORDER BY at, id")
                .bind(user),
            |row| {
                Ok(UserMonitorEvent {
                    user: col(row, "user_id")?,
                    tenant_monitor: col(row, "tenant_monitor_id")?,
                    event: decode(col(row, "event")?)?,
                    at: col(row, "at")?,
                })
            },
        )
        .await
    }
}

#[async_trait]
impl EvaluationLock for PgStore {
    /// Holds a transaction-scoped advisory lock on a lock-pool connection;
    /// dropping the guard rolls the transaction back and releases it.
    async fn lock_evaluation(&self, tenant_monitor: TenantMonitorId) -> Result<EvaluationGuard> {
        let mut tx = self.locks.begin().await.map_err(db_error)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key(tenant_monitor))
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        Ok(EvaluationGuard::new(tx))
    }
}

#[async_trait]
impl Liveness for PgStore {
    /// A failed ping closes the broken connection; the pool opens a fresh
    /// one on the next acquire
    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        sqlx::Connection::ping(&mut *conn).await.map_err(db_error)
    }
}
