use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for the rider core
#[derive(Debug)]
pub enum OkadaError {
    // Local validation errors - never reach the network
    Validation { field: String, reason: String },

    // Trip lifecycle errors
    Submission(String),
    Assignment(String),
    TripNotFound(String),
    InvalidPhase { operation: &'static str, phase: String },

    // Realtime transport errors
    Connection(String),
    ChannelClosed,
    SubscriptionDropped(String),

    // Network and HTTP client errors
    NetworkTimeout,
    NetworkConnection(String),
    HttpClient(String),
    HttpStatus { status: u16, body: String },
    InvalidUrl(String),

    // Serialization and parsing errors
    JsonParsing(String),
    JsonSerialization(String),
    InvalidFormat(String),

    // Auth errors
    AuthToken(String),
    TokenRefreshFailed(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for OkadaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OkadaError::Validation { field, reason } => {
                write!(f, "Invalid {}: {}", field, reason)
            }

            OkadaError::Submission(msg) => write!(f, "Trip submission failed: {}", msg),
            OkadaError::Assignment(msg) => write!(f, "Driver assignment failed: {}", msg),
            OkadaError::TripNotFound(id) => write!(f, "Trip not found: {}", id),
            OkadaError::InvalidPhase { operation, phase } => {
                write!(f, "Cannot {} while session is {}", operation, phase)
            }

            OkadaError::Connection(msg) => write!(f, "Realtime connection error: {}", msg),
            OkadaError::ChannelClosed => write!(f, "Realtime channel closed"),
            OkadaError::SubscriptionDropped(event) => {
                write!(f, "Subscription dropped for event: {}", event)
            }

            OkadaError::NetworkTimeout => write!(f, "Network request timed out"),
            OkadaError::NetworkConnection(msg) => write!(f, "Network connection error: {}", msg),
            OkadaError::HttpClient(msg) => write!(f, "HTTP client error: {}", msg),
            OkadaError::HttpStatus { status, body } => {
                write!(f, "HTTP {} response: {}", status, body)
            }
            OkadaError::InvalidUrl(msg) => write!(f, "Invalid URL: {}", msg),

            OkadaError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            OkadaError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),
            OkadaError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),

            OkadaError::AuthToken(msg) => write!(f, "Auth token error: {}", msg),
            OkadaError::TokenRefreshFailed(msg) => write!(f, "Token refresh failed: {}", msg),
        }
    }
}

impl std::error::Error for OkadaError {}

// Convenience type alias for Results
pub type OkadaResult<T> = Result<T, OkadaError>;

// Conversion implementations for common error types
impl From<reqwest::Error> for OkadaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OkadaError::NetworkTimeout
        } else if err.is_connect() {
            OkadaError::NetworkConnection(err.to_string())
        } else {
            OkadaError::HttpClient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for OkadaError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() {
            OkadaError::JsonParsing(err.to_string())
        } else {
            OkadaError::JsonSerialization(err.to_string())
        }
    }
}

// Helper functions for creating common errors
impl OkadaError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        OkadaError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn submission(msg: impl Into<String>) -> Self {
        OkadaError::Submission(msg.into())
    }

    pub fn assignment(msg: impl Into<String>) -> Self {
        OkadaError::Assignment(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        OkadaError::Connection(msg.into())
    }

    pub fn invalid_phase(operation: &'static str, phase: impl fmt::Display) -> Self {
        OkadaError::InvalidPhase {
            operation,
            phase: phase.to_string(),
        }
    }

    pub fn trip_not_found(trip_id: impl fmt::Display) -> Self {
        OkadaError::TripNotFound(trip_id.to_string())
    }

    /// True for failures the caller may retry as-is (transport trouble,
    /// not rejected input).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OkadaError::NetworkTimeout
                | OkadaError::NetworkConnection(_)
                | OkadaError::Connection(_)
                | OkadaError::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = OkadaError::TripNotFound("42".to_string());
        assert_eq!(error.to_string(), "Trip not found: 42");

        let error = OkadaError::validation("pickup", "missing coordinates");
        assert_eq!(error.to_string(), "Invalid pickup: missing coordinates");
    }

    #[test]
    fn test_invalid_phase_display() {
        let error = OkadaError::invalid_phase("cancel", "DriverAssigned");
        assert_eq!(
            error.to_string(),
            "Cannot cancel while session is DriverAssigned"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OkadaError::NetworkTimeout.is_retryable());
        assert!(OkadaError::ChannelClosed.is_retryable());
        assert!(!OkadaError::validation("fare", "must be positive").is_retryable());
        assert!(!OkadaError::Assignment("taken".to_string()).is_retryable());
    }

    #[test]
    fn test_helper_functions() {
        assert!(matches!(
            OkadaError::submission("rejected"),
            OkadaError::Submission(_)
        ));
        assert!(matches!(
            OkadaError::assignment("conflict"),
            OkadaError::Assignment(_)
        ));
        assert!(matches!(
            OkadaError::connection("unreachable"),
            OkadaError::Connection(_)
        ));
    }
}
