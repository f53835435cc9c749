use crate::tx::TransactionState;

/// Errors that can occur in the data layer.
#[derive(Debug)]
pub enum DataError {
    /// No active record with the given id exists for the entity.
    NotFound { entity: String, id: String },
    /// A write was rejected (constraint violation, duplicate id, read-only transaction).
    Write(String),
    /// A record could not be converted to or from a typed schema.
    Mapping(String),
    /// The registry has no constructor for this backend/entity pair.
    UnknownBackendOrEntity { backend: String, entity: String },
    /// A constructor was registered twice for the same backend/entity pair.
    DuplicateRegistration { backend: String, entity: String },
    /// A constructor received a connection handle of the wrong backend kind.
    ConnectionMismatch { expected: String, actual: String },
    /// Commit or rollback was attempted from a state that does not allow it.
    InvalidTransactionState {
        state: TransactionState,
        action: &'static str,
    },
    /// The operation is not supported by this backend.
    Unsupported(String),
    /// The caller's context was cancelled.
    Cancelled,
    /// The caller's deadline or the transaction timeout elapsed.
    DeadlineExceeded,
    /// The unit of work failed and the rollback that followed failed too.
    Rollback {
        source: Box<DataError>,
        rollback: Box<DataError>,
    },
    Database(Box<dyn std::error::Error + Send + Sync>),
    Other(String),
}

impl DataError {
    /// Construct a `Database` variant from any error type.
    ///
    /// Used by backend crates (e.g. `tenantry-data-sqlx`) to wrap
    /// driver-specific errors.
    pub fn database(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        DataError::Database(Box::new(err))
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DataError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn mapping(err: impl std::fmt::Display) -> Self {
        DataError::Mapping(err.to_string())
    }

    /// `true` for cancellation and deadline errors.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, DataError::Cancelled | DataError::DeadlineExceeded)
    }
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataError::NotFound { entity, id } => write!(f, "Not found: {entity} '{id}'"),
            DataError::Write(msg) => write!(f, "Write rejected: {msg}"),
            DataError::Mapping(msg) => write!(f, "Mapping error: {msg}"),
            DataError::UnknownBackendOrEntity { backend, entity } => {
                write!(f, "No repository registered for backend '{backend}' and entity '{entity}'")
            }
            DataError::DuplicateRegistration { backend, entity } => {
                write!(f, "Repository already registered for backend '{backend}' and entity '{entity}'")
            }
            DataError::ConnectionMismatch { expected, actual } => {
                write!(f, "Connection mismatch: expected {expected}, got {actual}")
            }
            DataError::InvalidTransactionState { state, action } => {
                write!(f, "Cannot {action} a transaction that is {state}")
            }
            DataError::Unsupported(what) => write!(f, "Unsupported: {what}"),
            DataError::Cancelled => write!(f, "Operation cancelled"),
            DataError::DeadlineExceeded => write!(f, "Deadline exceeded"),
            DataError::Rollback { source, rollback } => {
                write!(f, "{source} (rollback also failed: {rollback})")
            }
            DataError::Database(err) => write!(f, "Database error: {err}"),
            DataError::Other(msg) => write!(f, "Data error: {msg}"),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::Database(err) => Some(err.as_ref()),
            DataError::Rollback { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
