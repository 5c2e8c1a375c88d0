//! Error types for the domain layer.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use thiserror::Error;

/// Errors that occur during value object construction.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Field '{field}' cannot be empty")]
    EmptyField { field: String },

    #[error("Field '{field}' has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Creates an empty field validation error.
    pub fn empty_field(field: impl Into<String>) -> Self {
        ValidationError::EmptyField { field: field.into() }
    }

    /// Creates an invalid format validation error.
    pub fn invalid_format(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Error codes organized by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Validation errors
    ValidationFailed,

    // Tenancy errors
    TenantNotSet,
    CrossTenantAccess,

    // Not found errors
    EntityNotFound,

    // Persistence errors
    CommitFailed,
    KeyConflict,
    DatabaseError,

    // Messaging errors
    BrokerUnavailable,
    SerializationFailed,
    HandlerFailed,

    InternalError,
}

impl ErrorCode {
    /// Whether an operation failing with this code may succeed when retried
    /// without changing its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::BrokerUnavailable
                | ErrorCode::CommitFailed
                | ErrorCode::DatabaseError
                | ErrorCode::HandlerFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::TenantNotSet => "TENANT_NOT_SET",
            ErrorCode::CrossTenantAccess => "CROSS_TENANT_ACCESS",
            ErrorCode::EntityNotFound => "ENTITY_NOT_FOUND",
            ErrorCode::CommitFailed => "COMMIT_FAILED",
            ErrorCode::KeyConflict => "KEY_CONFLICT",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::BrokerUnavailable => "BROKER_UNAVAILABLE",
            ErrorCode::SerializationFailed => "SERIALIZATION_FAILED",
            ErrorCode::HandlerFailed => "HANDLER_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Standard domain error with code, message, and optional details.
#[derive(Debug, Clone)]
pub struct DomainError {
    pub code: ErrorCode,
    pub message: String,
    pub details: HashMap<String, String>,
}

impl DomainError {
    /// Creates a new domain error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// Creates a validation error for a specific field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message).with_detail("field", field.into())
    }

    /// The current unit of work was used before a tenant was set.
    pub fn tenant_not_set() -> Self {
        Self::new(
            ErrorCode::TenantNotSet,
            "No tenant has been set for the current unit of work",
        )
    }

    /// A write collided with a key the caller's tenant cannot see.
    ///
    /// Does not say who owns the key.
    pub fn key_conflict(entity_type: &str, key: &str) -> Self {
        Self::new(
            ErrorCode::KeyConflict,
            format!("{} '{}' already exists", entity_type, key),
        )
        .with_detail("entity_type", entity_type)
    }

    /// Adds a detail to the error.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// See [`ErrorCode::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for DomainError {}

impl From<ValidationError> for DomainError {
    fn from(err: ValidationError) -> Self {
        let field = match &err {
            ValidationError::EmptyField { field } => field.clone(),
            ValidationError::InvalidFormat { field, .. } => field.clone(),
        };
        DomainError::validation(field, err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}
