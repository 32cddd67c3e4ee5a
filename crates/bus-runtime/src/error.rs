//! Error types for broker client operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for transport, sender and processor operations
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Network failure: {message}")]
    Network { message: String },

    #[error("Transport operation '{operation}' failed: {message}")]
    Transport { operation: String, message: String },

    #[error("Entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Link '{link}' is closed")]
    LinkClosed { link: String },

    #[error("Delivery '{delivery_id}' is unknown or its lock was lost")]
    DeliveryNotFound { delivery_id: String },

    #[error("Client or component has been closed")]
    Closed,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidState { from: String, to: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BusError {
    /// Check if error is transient and the operation may succeed after reconnecting
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication { .. } => false,
            Self::Network { .. } => true,
            Self::Transport { .. } => false,
            Self::EntityNotFound { .. } => false,
            Self::LinkClosed { .. } => true,
            Self::DeliveryNotFound { .. } => false,
            Self::Closed => false,
            Self::InvalidState { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::Timeout { .. } => true,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if the underlying connection must be re-established
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::LinkClosed { .. })
    }

    pub(crate) fn transport(operation: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Failure raised by a user message handler.
///
/// Never propagates out of the processor: it is converted into a nack carrying
/// [`HandlerError::reason`] and routed to the error callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Handler failed: {reason}")]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    /// Create handler error with a reason that is forwarded to the broker
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
