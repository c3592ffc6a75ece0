//! Error types for the streaming SDK

use std::fmt;
use thiserror::Error;

/// Main error type for the SDK
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdkError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Send failed: not connected")]
    SendFailedNotConnected,

    #[error("Reconnect ceiling exceeded after {attempts} attempts (last close: {last_reason})")]
    ReconnectCeilingExceeded { attempts: u32, last_reason: String },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Observer failure: {0}")]
    Observer(String),

    #[error("Manager unavailable: {0}")]
    ManagerUnavailable(String),
}

/// Connection-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("Failed to establish connection: {0}")]
    EstablishmentFailed(String),

    #[error("Connection lost ({code}): {reason}")]
    DirtyClose { code: u16, reason: String },

    #[error("Connection closed by application")]
    CleanClose,

    #[error("Auth token unavailable")]
    TokenUnavailable,

    #[error("Heartbeat timeout: no pong within {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

impl ConnectionError {
    /// Whether this failure counts against the reconnect ceiling and schedules a retry
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::CleanClose)
    }
}

/// Parsing-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),
}

/// Subscription-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("No topics provided")]
    Empty,
}

/// Error severity levels
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Low,      // Swallowed locally
    Medium,   // Recoverable, retried
    High,     // Surfaced to the application
    Critical, // Persistent until a manual restart
}

impl ErrorSeverity {
    pub fn from_error(error: &SdkError) -> Self {
        match error {
            SdkError::Configuration(_) => ErrorSeverity::High,
            SdkError::Connection(conn_err) => match conn_err {
                ConnectionError::CleanClose => ErrorSeverity::Low,
                ConnectionError::TokenUnavailable => ErrorSeverity::High,
                _ => ErrorSeverity::Medium,
            },
            SdkError::Parse(_) => ErrorSeverity::Low,
            SdkError::Subscription(_) => ErrorSeverity::Medium,
            SdkError::SendFailedNotConnected => ErrorSeverity::High,
            SdkError::ReconnectCeilingExceeded { .. } => ErrorSeverity::Critical,
            SdkError::Server(_) => ErrorSeverity::Medium,
            SdkError::Observer(_) => ErrorSeverity::High,
            SdkError::ManagerUnavailable(_) => ErrorSeverity::Critical,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Error reporter for structured logging
pub struct ErrorReporter;

impl ErrorReporter {
    pub fn report_error(error: &SdkError, operation: &str) {
        let severity = ErrorSeverity::from_error(error);

        match severity {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                tracing::error!(%severity, operation, "{}", error);
            }
            ErrorSeverity::Medium => {
                tracing::warn!(%severity, operation, "{}", error);
            }
            ErrorSeverity::Low => {
                tracing::debug!(%severity, operation, "{}", error);
            }
        }
    }
}

/// Human readable description of a WebSocket close code (RFC 6455 section 7.4)
pub fn describe_close_code(code: u16) -> &'static str {
    match code {
        1000 => "normal closure",
        1001 => "going away",
        1002 => "protocol error",
        1003 => "unsupported data",
        1005 => "no status received",
        1006 => "abnormal closure",
        1007 => "invalid frame payload",
        1008 => "policy violation",
        1009 => "message too big",
        1010 => "mandatory extension missing",
        1011 => "internal server error",
        1012 => "service restart",
        1013 => "try again later",
        1015 => "TLS handshake failure",
        _ => "unknown reason",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            ErrorSeverity::from_error(&SdkError::ReconnectCeilingExceeded {
                attempts: 5,
                last_reason: "abnormal closure".to_string(),
            }),
            ErrorSeverity::Critical
        );
        assert_eq!(
            ErrorSeverity::from_error(&SdkError::Parse(ParseError::MalformedFrame("x".into()))),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_error(&SdkError::SendFailedNotConnected),
            ErrorSeverity::High
        );
    }

    #[test]
    fn test_clean_close_is_not_retryable() {
        assert!(!ConnectionError::CleanClose.is_retryable());
        assert!(ConnectionError::TokenUnavailable.is_retryable());
        assert!(ConnectionError::HandshakeTimeout(std::time::Duration::from_secs(10)).is_retryable());
    }

    #[test]
    fn test_close_code_descriptions() {
        assert_eq!(describe_close_code(1006), "abnormal closure");
        assert_eq!(describe_close_code(4000), "unknown reason");
    }
}
