//! Execution-layer error types.

use serde_json::Value;
use thiserror::Error;

/// One argument-schema violation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required property was not supplied.
    #[error("missing required parameter '{name}'")]
    MissingRequired { name: String },

    /// A supplied property is not declared in the schema.
    #[error("unknown parameter '{name}'")]
    UnknownParameter { name: String },

    /// A value's runtime type differs from the declared type.
    #[error("parameter '{name}' expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A value is outside the declared enum set.
    #[error("parameter '{name}' must be one of {allowed}, got {value}")]
    InvalidEnumValue {
        name: String,
        allowed: String,
        value: String,
    },

    /// The arguments themselves are not a JSON object.
    #[error("arguments must be an object, got {actual}")]
    NotAnObject { actual: String },
}

/// Errors raised by [`super::ToolExecutor`].
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("server not registered: '{server_id}'")]
    ServerNotFound { server_id: String },

    #[error("tool '{tool}' not found on server '{server_id}'")]
    ToolNotFound { server_id: String, tool: String },

    /// Schema validation failed; never retried.
    #[error("invalid arguments for '{tool}': {}", join_errors(.errors))]
    InvalidArguments {
        tool: String,
        errors: Vec<ValidationError>,
    },

    /// Every attempt failed.
    #[error("tool '{tool}' on '{server_id}' failed after {attempts} attempt(s) in {elapsed_ms}ms: {last_error}")]
    Failed {
        server_id: String,
        tool: String,
        arguments: Value,
        attempts: u32,
        elapsed_ms: u64,
        last_error: String,
    },
}

impl ExecutionError {
    /// Number of attempts made before giving up (0 when the call never ran).
    pub fn attempts(&self) -> u32 {
        match self {
            ExecutionError::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by [`super::ResultHandler::handle_with_retry`].
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The operation kept failing and the handler is set to throw.
    #[error("'{operation}' failed after {attempts} attempt(s) [{category}]: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        category: String,
        last_error: String,
    },
}
