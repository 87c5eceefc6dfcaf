//! Watchtower Engine
//!
//! Evaluates tenant monitors and drives everything that follows a run.
//!
//! - [`Evaluator`] runs one tenant monitor end to end: query, exclusion
//!   filter, classification, persistence, action-item reconciliation
//! - [`Scheduler`] exposes the refresh jobs a host scheduler calls
//! - [`ExclusionService`], [`MonitorService`] and [`WatcherManager`] carry
//!   the user-facing operations on exclusions, definitions and watchers
//! - [`timeline`], [`export`] and [`badges`] answer read-side questions

pub mod badges;
pub mod classifier;
pub mod definitions;
pub mod evaluator;
pub mod events;
pub mod exclusions;
pub mod export;
pub mod notify;
pub mod pool;
pub mod reconciler;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod timeline;
pub mod watchers;

pub use badges::BadgeService;
pub use definitions::MonitorService;
pub use evaluator::{Evaluation, Evaluator, EvaluatorConfig};
pub use events::{group_changes, EventDispatcher, ResourceChange};
pub use exclusions::{ExclusionRecord, ExclusionService};
pub use export::{ExportService, Sheet, Snapshot, SnapshotOptions};
pub use notify::{Email, HttpMailer, NotificationConfig, Notifier, NullNotifier, RecordingNotifier};
pub use pool::{WorkerPool, DEFAULT_POOL_SIZE};
pub use reconciler::{ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use runtime::{GatewayEnvironment, NoGateway, Runtime};
pub use scheduler::{JobSummary, Scheduler};
pub use stats::{EvaluationStats, StatsSnapshot};
pub use timeline::{Interval, TimelineEvent};
pub use watchers::WatcherManager;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::evaluator::{Evaluation, Evaluator};
    pub use crate::exclusions::ExclusionService;
    pub use crate::reconciler::Reconciler;
    pub use crate::scheduler::{JobSummary, Scheduler};
    pub use crate::watchers::WatcherManager;
}
