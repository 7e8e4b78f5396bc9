//! Errors returned by event listeners.
//!
//! A listener's error aborts the operation that fired it: a failing
//! `before_insert` keeps the record pending, a failing `set` leaves the
//! attribute unchanged.

use crate::error::ModelError;

/// Failure raised while binding or running an event listener.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventError {
    /// The listener rejected the target's state
    #[error("Validation error: {message}{}", format_hint(hint))]
    Validation { message: String, hint: Option<String> },

    #[error("Listener error: {message}")]
    Listener { message: String },

    /// Event name or target could not be bound
    #[error("Invalid event configuration: {message}")]
    InvalidConfiguration { message: String },
}

fn format_hint(hint: &Option<String>) -> String {
    hint.as_ref().map(|h| format!(" (hint: {})", h)).unwrap_or_default()
}

impl EventError {
    pub fn validation(message: &str) -> Self {
        Self::Validation {
            message: message.to_string(),
            hint: None,
        }
    }

    pub fn validation_with_hint(message: &str, hint: &str) -> Self {
        Self::Validation {
            message: message.to_string(),
            hint: Some(hint.to_string()),
        }
    }

    /// Any other listener failure.
    pub fn observer(message: &str) -> Self {
        Self::Listener {
            message: message.to_string(),
        }
    }

    pub fn invalid_configuration(message: &str) -> Self {
        Self::InvalidConfiguration {
            message: message.to_string(),
        }
    }
}

/// Lets listeners use `?` on record operations such as `ctx.target.set(..)`.
impl From<ModelError> for EventError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Validation(message) => Self::Validation { message, hint: None },
            ModelError::Configuration(message) => Self::InvalidConfiguration { message },
            other => Self::observer(&other.to_string()),
        }
    }
}
