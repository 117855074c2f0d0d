use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following STRATA-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Resource errors (memory, spill, cache budget)
/// - **2000-2999**: Execution errors (plan lifecycle, cancellation)
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Scheduling errors (worker pool)
/// - **5000-5999**: Internal/System errors
///
/// Codes are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Resource Errors (1000-1999) ===
    /// STRATA-1001: Writing or reading a spill segment failed
    SpillFailed = 1001,
    /// STRATA-1002: Assembled cache result exceeded the byte budget
    CacheBudgetExceeded = 1002,
    /// STRATA-1003: Unknown or released tuple buffer
    BufferNotFound = 1003,
    /// STRATA-1004: Requested row range is outside the written rows
    RowRangeOutOfBounds = 1004,
    /// STRATA-1005: Row arity does not match the buffer schema
    InvalidRow = 1005,

    // === Execution Errors (2000-2999) ===
    /// STRATA-2001: Query cancelled by its caller
    QueryCancelled = 2001,
    /// STRATA-2002: Query exceeded its wall-clock deadline
    QueryTimeout = 2002,
    /// STRATA-2003: next_batch called before open
    PlanNotOpen = 2003,
    /// STRATA-2004: open called twice
    PlanAlreadyOpen = 2004,
    /// STRATA-2005: A plan node produced an out-of-order batch
    PlanContractViolation = 2005,
    /// STRATA-2006: Remote source fetch failed after retries
    SourceFetchFailed = 2006,

    // === Configuration Errors (3000-3999) ===
    /// STRATA-3001: Configuration value rejected
    InvalidConfig = 3001,

    // === Scheduling Errors (4000-4999) ===
    /// STRATA-4001: Work submitted to a pool that is shut down
    WorkRejected = 4001,
    /// STRATA-4002: A work item failed or panicked
    WorkItemFailed = 4002,

    // === Internal Errors (5000-5999) ===
    /// STRATA-5002: Serialization/deserialization failed
    SerializationFailed = 5002,
    /// STRATA-5003: Unexpected internal state
    InternalPanic = 5003,
    /// STRATA-5004: Result cache backend failed
    CacheStoreFailed = 5004,
    /// STRATA-5005: Filesystem error
    Io = 5005,

    /// STRATA-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "STRATA-2001")
    pub fn as_str(&self) -> String {
        format!("STRATA-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Resource,
            2000..=2999 => ErrorCategory::Execution,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Scheduling,
            5000..=5999 => ErrorCategory::Internal,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("STRATA-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::SpillFailed),
            1002 => Ok(Self::CacheBudgetExceeded),
            1003 => Ok(Self::BufferNotFound),
            1004 => Ok(Self::RowRangeOutOfBounds),
            1005 => Ok(Self::InvalidRow),
            2001 => Ok(Self::QueryCancelled),
            2002 => Ok(Self::QueryTimeout),
            2003 => Ok(Self::PlanNotOpen),
            2004 => Ok(Self::PlanAlreadyOpen),
            2005 => Ok(Self::PlanContractViolation),
            2006 => Ok(Self::SourceFetchFailed),
            3001 => Ok(Self::InvalidConfig),
            4001 => Ok(Self::WorkRejected),
            4002 => Ok(Self::WorkItemFailed),
            5002 => Ok(Self::SerializationFailed),
            5003 => Ok(Self::InternalPanic),
            5004 => Ok(Self::CacheStoreFailed),
            5005 => Ok(Self::Io),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Resource,
    Execution,
    Config,
    Scheduling,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::SpillFailed.as_str(), "STRATA-1001");
        assert_eq!(ErrorCode::QueryCancelled.as_str(), "STRATA-2001");
        assert_eq!(ErrorCode::Unknown.as_str(), "STRATA-9999");
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(
            ErrorCode::try_from("STRATA-1002".to_string()).unwrap(),
            ErrorCode::CacheBudgetExceeded
        );
        assert_eq!(
            ErrorCode::try_from("STRATA-9999".to_string()).unwrap(),
            ErrorCode::Unknown
        );
    }

    #[test]
    fn test_error_code_parsing_errors() {
        assert!(ErrorCode::try_from("INVALID".to_string()).is_err());
        assert!(ErrorCode::try_from("STRATA-0000".to_string()).is_err());
        assert!(ErrorCode::try_from("STRATA-ABC".to_string()).is_err());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::SpillFailed.category(), ErrorCategory::Resource);
        assert_eq!(
            ErrorCode::PlanNotOpen.category(),
            ErrorCategory::Execution
        );
        assert_eq!(ErrorCode::InvalidConfig.category(), ErrorCategory::Config);
        assert_eq!(
            ErrorCode::WorkRejected.category(),
            ErrorCategory::Scheduling
        );
        assert_eq!(ErrorCode::InternalPanic.category(), ErrorCategory::Internal);
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Internal);
    }
}
