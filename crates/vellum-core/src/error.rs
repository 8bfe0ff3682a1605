//! The error taxonomy shared by every vellum crate.

/// Errors surfaced by the vellum document store.
#[derive(Debug, thiserror::Error)]
pub enum VellumError {
    /// A document, field path, or schema definition failed validation.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// A unique index rejected a write.
    #[error("unique constraint violated on field '{field}'")]
    UniqueConstraint {
        /// The constrained field (dotted path) that collided.
        field: String,
        /// The `_id` of the document that triggered the violation, when known.
        id: Option<String>,
    },

    /// `put`/`atomic_update` addressed an `_id` that does not exist.
    #[error("document not found: {id}")]
    NotFound {
        /// The `_id` that was looked up.
        id: String,
    },

    /// An optimistic update carried a stale expected version.
    #[error("version mismatch for {id}: expected {expected}, actual {actual}")]
    VersionMismatch {
        /// The `_id` of the contested document.
        id: String,
        /// The version the caller expected.
        expected: i64,
        /// The version currently stored.
        actual: i64,
    },

    /// A backend error that maps to no more specific kind.
    #[error("database error: {message}")]
    Database {
        /// The backend's error message.
        message: String,
        /// The SQL text being executed, when available.
        sql: Option<String>,
    },

    /// A transaction failed and rollback revealed a closed database.
    /// The original failure is preserved as the source.
    #[error("transaction failed, database closed: {cause}")]
    TransactionDbClosed {
        /// The error that aborted the transaction.
        #[source]
        cause: Box<VellumError>,
    },

    /// An operation was attempted on a closed driver.
    #[error("driver is closed")]
    DriverClosed,

    /// An acquire raced with pool shutdown.
    #[error("connection pool is closing")]
    PoolClosing,

    /// A pool acquire waited past its deadline.
    #[error("timed out acquiring a connection after {waited_ms}ms")]
    AcquireTimeout {
        /// How long the waiter was queued.
        waited_ms: u64,
    },

    /// Creating a new pooled connection exceeded its deadline.
    #[error("timed out creating a connection after {waited_ms}ms")]
    CreateTimeout {
        /// How long creation was allowed to run.
        waited_ms: u64,
    },

    /// Reconnection attempts were exhausted.
    #[error("failed to reconnect after {attempts} attempts: {last_error}")]
    MaxReconnect {
        /// Number of attempts made.
        attempts: u32,
        /// The final connection error.
        last_error: String,
    },

    /// A plugin hook raised an error.
    #[error("plugin '{plugin}' failed in {hook}: {message}")]
    Plugin {
        /// Name of the offending plugin.
        plugin: String,
        /// The hook that was executing.
        hook: String,
        /// The plugin's error message.
        message: String,
    },

    /// A plugin hook overran its time budget.
    #[error("plugin '{plugin}' exceeded its {budget_ms}ms budget in {hook}")]
    PluginTimeout {
        /// Name of the offending plugin.
        plugin: String,
        /// The hook that was executing.
        hook: String,
        /// The configured budget.
        budget_ms: u64,
    },

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VellumError>;

impl VellumError {
    // -- Constructors --------------------------------------------------------

    /// Creates a [`VellumError::Validation`] with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a [`VellumError::NotFound`] for the given `_id`.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a [`VellumError::UniqueConstraint`] naming the colliding field.
    pub fn unique(field: impl Into<String>, id: Option<String>) -> Self {
        Self::UniqueConstraint {
            field: field.into(),
            id,
        }
    }

    /// Creates a [`VellumError::Database`] without associated SQL text.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql: None,
        }
    }

    /// Creates a [`VellumError::Database`] carrying the SQL being executed.
    pub fn database_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    // -- Predicates ----------------------------------------------------------

    /// Returns `true` if this is a [`VellumError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a [`VellumError::VersionMismatch`].
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }

    /// Returns `true` if this is a [`VellumError::UniqueConstraint`].
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueConstraint { .. })
    }

    /// Returns `true` if the error is transient and the operation may succeed
    /// on retry (pool contention, reconnectable connection failures).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. } | Self::CreateTimeout { .. }
        )
    }

    /// A stable machine-readable kind for each variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::UniqueConstraint { .. } => "unique_constraint",
            Self::NotFound { .. } => "not_found",
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::Database { .. } => "database",
            Self::TransactionDbClosed { .. } => "transaction_db_closed",
            Self::DriverClosed => "driver_closed",
            Self::PoolClosing => "pool_closing",
            Self::AcquireTimeout { .. } => "acquire_timeout",
            Self::CreateTimeout { .. } => "create_timeout",
            Self::MaxReconnect { .. } => "max_reconnect",
            Self::Plugin { .. } => "plugin",
            Self::PluginTimeout { .. } => "plugin_timeout",
            Self::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_and_predicates() {
        let err = VellumError::not_found("abc");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), "not_found");

        let err = VellumError::unique("email", Some("u1".into()));
        assert!(err.is_unique_violation());
        assert_eq!(err.to_string(), "unique constraint violated on field 'email'");
    }

    #[test]
    fn version_mismatch_carries_both_versions() {
        let err = VellumError::VersionMismatch {
            id: "doc1".into(),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_version_mismatch());
        assert_eq!(
            err.to_string(),
            "version mismatch for doc1: expected 1, actual 2"
        );
    }

    #[test]
    fn transaction_db_closed_preserves_cause() {
        let cause = VellumError::database("disk I/O error");
        let err = VellumError::TransactionDbClosed {
            cause: Box::new(cause),
        };
        assert!(err.to_string().contains("disk I/O error"));
        assert_eq!(err.kind(), "transaction_db_closed");
    }

    #[test]
    fn retryable_kinds() {
        assert!(VellumError::AcquireTimeout { waited_ms: 10 }.is_retryable());
        assert!(!VellumError::DriverClosed.is_retryable());
    }
}
