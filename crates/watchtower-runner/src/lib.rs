//! Watchtower Runner
//!
//! Executes monitor queries against their backends.
//!
//! - [`InternalRunner`] expands logical tables and reads the compliance
//!   application's own database
//! - [`CloudRunner`] fans a query out over every connected cloud account of
//!   the tenant through the cloud-query gateway
//! - [`Dispatcher`] picks the runner for a query context and keeps results
//!   under the size limit

pub mod cloud;
pub mod dispatcher;
pub mod executor;
pub mod internal;
pub mod runner;

pub use cloud::{
    build_profile, CloudRunner, CommandGateway, Credential, CredentialProvider, CredentialStatus,
    GatewayCommands, GatewayControl, PgCredentialProvider, ProfileDirectory, RetryPolicy,
};
pub use dispatcher::{Dispatcher, DEFAULT_MAX_RESULT_BYTES};
pub use executor::{statement_text, ExecutorConfig, PgQueryExecutor, QueryExecutor};
pub use internal::InternalRunner;
pub use runner::{PartialRun, RunOutput, RunRequest, Runner};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::dispatcher::Dispatcher;
    pub use crate::runner::{RunOutput, RunRequest, Runner};
    pub use tokio_util::sync::CancellationToken;
}
