//! Error types for the declarative layer
//!
//! Every fallible operation in the crate returns [`ModelResult`]. Listener
//! failures use [`EventError`](crate::event_error::EventError) and are
//! converted on the way out.

use std::fmt;

use crate::event_error::EventError;

/// Result type alias for model operations
pub type ModelResult<T> = Result<T, ModelError>;

/// Error types for declarative model operations
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Database connection or query error
    Database(String),
    /// Connection pool error
    Connection(String),
    /// Row lookup came back empty
    NotFound(String),
    /// A single-row lookup matched more than one row
    MultipleResultsFound(String),
    /// Value rejected while coercing or validating
    Validation(String),
    /// Serialization/deserialization error
    Serialization(String),
    /// Model or relationship misconfiguration detected at registration
    Configuration(String),
    /// Attribute name not mapped on the model
    UnknownAttribute { model: String, attribute: String },
    /// An operation needed a mapped declarative base and none was configured
    Unmapped(String),
    /// A bind key was requested that has no configured engine
    UnboundBindKey(String),
    /// No engine is configured for the session
    UnboundExecution,
    /// Value is not one of the symbols of an enum type
    InvalidEnumValue { enum_name: String, value: String },
    /// Requested page is outside the result set
    IndexOutOfRange { page: i64 },
    /// Event listener failed
    Event(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Database(msg) => write!(f, "Database error: {}", msg),
            ModelError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ModelError::NotFound(table) => write!(f, "Record not found in table '{}'", table),
            ModelError::MultipleResultsFound(table) => {
                write!(f, "Multiple rows were found in table '{}' when one was required", table)
            }
            ModelError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ModelError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            ModelError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ModelError::UnknownAttribute { model, attribute } => {
                write!(f, "Model '{}' has no mapped attribute '{}'", model, attribute)
            }
            ModelError::Unmapped(msg) => write!(f, "Unmapped error: {}", msg),
            ModelError::UnboundBindKey(key) => {
                write!(f, "Bind '{}' is not specified. Set it in the binds configuration", key)
            }
            ModelError::UnboundExecution => {
                write!(f, "No database engine is configured for this session")
            }
            ModelError::InvalidEnumValue { enum_name, value } => {
                write!(f, "Invalid {} value: '{}'", enum_name, value)
            }
            ModelError::IndexOutOfRange { page } => {
                write!(f, "Page {} is out of range", page)
            }
            ModelError::Event(msg) => write!(f, "Event error: {}", msg),
        }
    }
}

impl std::error::Error for ModelError {}

// Convert from sqlx errors
impl From<sqlx::Error> for ModelError {
    fn from(err: sqlx::Error) -> Self {
        ModelError::Database(err.to_string())
    }
}

// Convert from serde_json errors
impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<EventError> for ModelError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Validation { .. } => ModelError::Validation(err.to_string()),
            EventError::InvalidConfiguration { message } => ModelError::Configuration(message),
            other => ModelError::Event(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ModelError::UnboundBindKey("reporting".to_string());
        assert!(err.to_string().contains("reporting"));

        let err = ModelError::InvalidEnumValue {
            enum_name: "OrderStatus".to_string(),
            value: "x".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid OrderStatus value: 'x'");

        let err = ModelError::IndexOutOfRange { page: 0 };
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_event_error_conversion() {
        let err: ModelError = EventError::validation("bad value").into();
        assert!(matches!(err, ModelError::Validation(_)));

        let err: ModelError = EventError::observer("listener blew up").into();
        assert!(matches!(err, ModelError::Event(msg) if msg.contains("listener blew up")));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: ModelError = parse.unwrap_err().into();
        assert!(matches!(err, ModelError::Serialization(_)));
    }
}
