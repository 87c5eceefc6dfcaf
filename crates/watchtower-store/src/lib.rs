//! Watchtower Store
//!
//! Persistence for monitor definitions, tenant bindings, the append-only
//! result log, exclusions with their event history, watcher lists and
//! action items.
//!
//! Two implementations share the [`Store`] traits:
//! - [`PgStore`] for production, with advisory locks serialising
//!   evaluations of the same tenant monitor across processes
//! - [`MemoryStore`] for tests and dry runs

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::{connect, db_error, PgStore, PoolConfig};
pub use store::{
    ActionItemStore, EvaluationGuard, EvaluationLock, EvaluationRecord, ExclusionChange,
    ExclusionStore, Liveness, MonitorStore, ResultStore, ResultUpdate, Store, TenantStore,
    UserEventStore, WatcherStore,
};
