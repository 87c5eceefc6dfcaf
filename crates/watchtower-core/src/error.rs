//! Error types for Watchtower

/// Result type alias using Watchtower's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Watchtower operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The monitor query could not be parsed or violates the read-only grammar
    #[error("{0}")]
    Parse(String),

    /// A table referenced by a query is neither logical, cloud nor whitelisted
    #[error("table \"{0}\" does not exist")]
    UnknownTable(String),

    /// The validation query returned no rows for the tenant
    #[error("validation query returned no rows for tenant {tenant}")]
    ValidationFailure { tenant: String },

    /// A credential record cannot be turned into a gateway profile
    #[error("credential {credential} is missing configuration: {reason}")]
    CredentialConfigurationMissing { credential: String, reason: String },

    /// Connection lost, port busy or session conflict on the cloud gateway
    #[error("cloud gateway error: {0}")]
    GatewayTransient(String),

    /// Serialized result exceeds the configured maximum
    #[error("result is too large: {size} bytes exceeds the limit of {limit} bytes")]
    ResultTooLarge { size: usize, limit: usize },

    /// Database errors from either store or runner
    #[error("database error: {0}")]
    Database(String),

    /// Entity lookup failed
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Uniqueness or state conflicts
    #[error("conflict: {0}")]
    Conflict(String),

    /// An invariant of the data model would be violated
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Timeline construction errors
    #[error("timeline error: {0}")]
    Timeline(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Notification delivery errors
    #[error("notification error: {0}")]
    Notification(String),

    /// The run was cancelled or hit its statement timeout
    #[error("operation cancelled")]
    Cancelled,

    /// Network/IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new unknown table error
    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownTable(table.into())
    }

    /// Create a new database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a new conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the query was rejected before execution.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::UnknownTable(_))
    }

    /// Whether a retry against the cloud gateway may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::GatewayTransient(_) => true,
            Self::Database(msg) => is_transient_message(msg),
            _ => false,
        }
    }

    /// Message stored in `ResultData::error` when a run degrades.
    pub fn status_message(&self) -> String {
        match self {
            Self::Database(msg) | Self::GatewayTransient(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Driver messages that indicate the gateway process went away or is
/// still holding its listener.
pub fn is_transient_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    const MARKERS: &[&str] = &[
        "connection lost",
        "connection refused",
        "connection reset",
        "server closed the connection",
        "terminating connection",
        "port is busy",
        "address already in use",
        "already in use",
        "session conflict",
        "could not serialize access",
        "pool timed out",
    ];
    MARKERS.iter().any(|marker| msg.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_table_message_matches_analyzer_wording() {
        let err = Error::unknown_table("foo");
        assert_eq!(err.to_string(), "table \"foo\" does not exist");
        assert!(err.is_rejection());
    }

    #[test]
    fn transient_detection() {
        assert!(Error::database("FATAL: terminating connection due to administrator command")
            .is_transient());
        assert!(Error::GatewayTransient("boom".into()).is_transient());
        assert!(!Error::database("relation \"x\" does not exist").is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn status_message_strips_prefix_for_driver_errors() {
        assert_eq!(
            Error::database("syntax error at or near \"form\"").status_message(),
            "syntax error at or near \"form\""
        );
        assert_eq!(Error::Cancelled.status_message(), "operation cancelled");
    }
}
