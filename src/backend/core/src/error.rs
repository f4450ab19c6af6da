//! Error handling for Tributary Core.
//!
//! This module provides:
//! - A single crate error type with context and chaining
//! - Error codes for machine-readable reporting
//! - User-friendly messages vs detailed internal messages
//! - Severity-based logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use tributary_core::error::{ErrorContext, Result};
//!
//! fn open_slot() -> Result<()> {
//!     some_operation().context("Failed to open replication slot")?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Tributary operations.
pub type Result<T> = std::result::Result<T, TributaryError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Source Errors (1000-1099)
    SourceNotFound,
    SourceStartFailed,
    SourceStopFailed,
    SubscriberFailed,
    AcquisitionFailed,

    // Outbound Errors (1100-1199)
    JournalFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,

    // Redis Errors (2100-2199)
    RedisError,
    RedisConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Broker / External Errors (3000-3099)
    BrokerError,
    BrokerConnectionFailed,
    NetworkError,
    Timeout,

    // Filesystem Errors (3100-3199)
    WatchFailed,
    IoError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,
    UnsupportedFeature,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::SourceNotFound => 1000,
            Self::SourceStartFailed => 1001,
            Self::SourceStopFailed => 1002,
            Self::SubscriberFailed => 1003,
            Self::AcquisitionFailed => 1004,

            Self::JournalFailed => 1101,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,

            Self::RedisError => 2100,
            Self::RedisConnectionFailed => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::BrokerError => 3000,
            Self::BrokerConnectionFailed => 3001,
            Self::NetworkError => 3003,
            Self::Timeout => 3004,

            Self::WatchFailed => 3100,
            Self::IoError => 3101,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,
            Self::UnsupportedFeature => 5003,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Poll loops retry every error regardless; this flag is informational
    /// for callers deciding whether to re-issue a `start`.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquisitionFailed
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::RedisConnectionFailed
                | Self::RedisError
                | Self::BrokerError
                | Self::BrokerConnectionFailed
                | Self::NetworkError
                | Self::Timeout
        )
    }

    /// Check if this error is a configuration problem.
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationError
                | Self::MissingConfiguration
                | Self::InvalidConfiguration
                | Self::UnsupportedFeature
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "source",
            1100..=1199 => "outbound",
            2000..=2099 => "database",
            2100..=2199 => "redis",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            3100..=3199 => "filesystem",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad configuration, unknown ids)
    Low,
    /// Operational issues (broker hiccups, timeouts, subscriber failures)
    Medium,
    /// System errors (database failures, serialization bugs)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::SourceNotFound
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::UnsupportedFeature => Self::Low,

            ErrorCode::SubscriberFailed
            | ErrorCode::AcquisitionFailed
            | ErrorCode::JournalFailed
            | ErrorCode::BrokerError
            | ErrorCode::NetworkError
            | ErrorCode::Timeout
            | ErrorCode::WatchFailed => Self::Medium,

            ErrorCode::SourceStartFailed
            | ErrorCode::SourceStopFailed
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::RedisError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::IoError => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::RedisConnectionFailed
            | ErrorCode::BrokerConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (source, job, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Tributary Core.
#[derive(Error, Debug)]
pub struct TributaryError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TributaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl TributaryError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// One-line description suitable for status reporting.
    pub fn summary(&self) -> String {
        match &self.internal_message {
            Some(internal) => format!("{}: {}", self.user_message, internal),
            None => self.user_message.to_string(),
        }
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check if this error is a configuration problem.
    pub fn is_configuration(&self) -> bool {
        self.code.is_configuration()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "System error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Operational error"
                );
            }
            ErrorSeverity::Low => {
                tracing::info!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "tributary_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| TributaryError::internal(message.into()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| TributaryError::internal(message.into()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for TributaryError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::Database(_) => (
                ErrorCode::DatabaseQueryFailed,
                "A database query failed",
            ),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            sqlx::Error::Configuration(_) => (
                ErrorCode::InvalidConfiguration,
                "Database connection settings are invalid",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for TributaryError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (
                ErrorCode::RedisConnectionFailed,
                "Unable to connect to redis",
            )
        } else if error.is_timeout() {
            (ErrorCode::RedisError, "Redis operation timed out")
        } else {
            (ErrorCode::RedisError, "A redis error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for TributaryError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<notify::Error> for TributaryError {
    fn from(error: notify::Error) -> Self {
        let code = match &error.kind {
            notify::ErrorKind::PathNotFound => ErrorCode::InvalidConfiguration,
            notify::ErrorKind::Io(_) => ErrorCode::IoError,
            _ => ErrorCode::WatchFailed,
        };

        Self::with_internal(code, "Filesystem watch failed", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for TributaryError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for TributaryError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::IoError, "File or resource not found"),
            ErrorKind::PermissionDenied => (ErrorCode::IoError, "Permission denied"),
            ErrorKind::TimedOut => (ErrorCode::Timeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::IoError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for TributaryError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<TributaryError>() {
            Ok(tributary_error) => tributary_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                format!("{:#}", error),
            ),
        }
    }
}

impl From<config::ConfigError> for TributaryError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (
                ErrorCode::ConfigurationError,
                "Configuration error occurred",
            ),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl TributaryError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// Create a missing configuration error for a named field.
    pub fn missing_configuration(source_kind: &str, field: &str) -> Self {
        Self::new(
            ErrorCode::MissingConfiguration,
            format!("{} {} must be provided", source_kind, field),
        )
        .with_context("field", field)
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    /// Create an error for a source type compiled out of this build.
    pub fn unsupported_feature(feature: &str) -> Self {
        Self::new(
            ErrorCode::UnsupportedFeature,
            format!("Support for '{}' sources is not compiled into this build", feature),
        )
        .with_details(
            ErrorDetails::new()
                .with_suggestion(format!("Rebuild tributary-core with `--features {}`", feature)),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Source Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a source not found error.
    pub fn source_not_found(source_id: impl Into<String>) -> Self {
        let id = source_id.into();
        Self::new(ErrorCode::SourceNotFound, format!("Event source not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("source", &id))
    }

    /// Create a subscriber failure error for an emission.
    pub fn subscriber_failed(
        source_id: &str,
        failed: usize,
        total: usize,
        first_failure: impl Into<String>,
    ) -> Self {
        Self::with_internal(
            ErrorCode::SubscriberFailed,
            format!(
                "{} of {} subscribers failed for event from {}",
                failed, total, source_id
            ),
            first_failure,
        )
        .with_details(ErrorDetails::new().with_entity("source", source_id))
        .with_context("failed", failed)
        .with_context("total", total)
    }

    /// Create an acquisition error for a poll iteration.
    pub fn acquisition(source_id: &str, message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::AcquisitionFailed,
            format!("Failed to acquire events for {}", source_id),
            message,
        )
    }

    /// Create a broker error.
    pub fn broker(broker: &str, message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::BrokerError,
            format!("{} operation failed", broker),
            message,
        )
        .with_context("broker", broker)
    }

    /// Create a broker connection error.
    pub fn broker_connection(broker: &str, message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::BrokerConnectionFailed,
            format!("Unable to connect to {}", broker),
            message,
        )
        .with_context("broker", broker)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
