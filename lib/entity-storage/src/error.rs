use std::fmt;

use thiserror::Error;

/// Boxed engine error, kept intact so callers can downcast to the driver's type.
pub type EngineError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldViolation {
    pub property: String,
    pub message: String,
    pub value: serde_json::Value,
}

impl FieldViolation {
    pub fn new(
        property: impl Into<String>,
        message: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
            value,
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (got {})", self.property, self.message, self.value)
    }
}

/// Lifecycle operation that failed against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Count,
    Synchronize,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Count => "count",
            Operation::Synchronize => "synchronize",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("{entity} not found: {criteria}")]
    EntityNotFound { entity: String, criteria: String },

    #[error("Validation failed: {}", format_violations(.0))]
    ValidationFailed(Vec<FieldViolation>),

    #[error("{operation} on {entity} failed: {source}")]
    StoreOperationFailed {
        operation: Operation,
        entity: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl StorageError {
    pub fn engine(error: impl Into<EngineError>) -> Self {
        StorageError::Engine(error.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        StorageError::PreconditionViolated(message.into())
    }

    /// Whether this error is one callers branch on directly and which the
    /// lifecycle boundary must not re-wrap.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            StorageError::NotInitialized(_)
                | StorageError::EntityNotFound { .. }
                | StorageError::ValidationFailed(_)
                | StorageError::PreconditionViolated(_)
                | StorageError::StoreOperationFailed { .. }
        )
    }
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
