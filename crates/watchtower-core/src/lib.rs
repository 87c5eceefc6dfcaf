//! Watchtower Core
//!
//! Core types and error handling shared across Watchtower components.
//!
//! This crate provides:
//! - Monitor definitions, tenant bindings and persisted results
//! - Exclusions and their append-only event history
//! - Watcher lists, subscriptions and action items
//! - The tabular result shape stored for every run
//! - Error types and result handling

pub mod error;
pub mod result;
pub mod types;

pub use error::{Error, Result};
pub use result::{ExcludedRow, ResultData};
pub use types::{
    ActionItem, ActionItemStatus, CloudVendor, Exclusion, ExclusionEvent, ExclusionEventType,
    ExclusionId, Frequency, HealthCondition, Monitor, MonitorId, MonitorKind, MonitorResult,
    ObjectType, QueryContext, Status, SubscriptionEvent, SubscriptionKind, Tenant, TenantId,
    TenantMonitor, TenantMonitorId, Urgency, User, UserId, UserMonitorEvent,
    UserMonitorEventKind, WatcherList,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::result::{ExcludedRow, ResultData};
    pub use crate::types::{
        HealthCondition, Monitor, MonitorKind, QueryContext, Status, TenantMonitor, Urgency,
    };
}
