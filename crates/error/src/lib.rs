//! # strata-error
//!
//! Unified error types for the Strata execution substrate.
//!
//! Every error carries:
//! - A stable numeric code (STRATA-XXXX)
//! - Optional structured JSON context
//! - An optional hint describing how to recover

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unified error type for all Strata operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataError {
    /// Numeric error code (e.g., "STRATA-1001")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Suggestion for recovering from the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Correlation ID, usually the query id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl StrataError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
            trace_id: None,
        }
    }

    /// Query was cancelled by its caller or by a watchdog.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::QueryCancelled, message)
    }

    /// Internal invariant was broken.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalPanic, message)
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a recovery hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Add trace ID for correlation
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Whether the error aborts the owning query.
    ///
    /// Cache failures and budget overflows are recoverable (the plan runs
    /// live instead); everything else terminates the plan.
    pub fn is_query_fatal(&self) -> bool {
        !matches!(
            self.code,
            ErrorCode::CacheBudgetExceeded | ErrorCode::CacheStoreFailed
        )
    }

    /// Whether the error was caused by cancellation or a deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::QueryCancelled | ErrorCode::QueryTimeout
        )
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize StrataError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }

    /// Serialize to pretty JSON for logging
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.to_json())
    }
}

impl fmt::Display for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for StrataError {}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
