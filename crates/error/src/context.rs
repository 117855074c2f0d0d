//! # Error Contexts
//!
//! Structured metadata attached to errors for programmatic handling.

use serde::{Deserialize, Serialize};

/// Structured context for errors.
///
/// Each variant provides the fields relevant to one family of error codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for STRATA-1001 (SpillFailed)
    Spill {
        buffer_id: String,
        path: Option<String>,
        segment_rows: usize,
    },

    /// Context for STRATA-1002 (CacheBudgetExceeded)
    CacheBudget {
        cache_id: String,
        size_bytes: usize,
        max_size_bytes: usize,
    },

    /// Context for STRATA-1003 (BufferNotFound)
    Buffer { buffer_id: String },

    /// Context for STRATA-1004 (RowRangeOutOfBounds)
    RowRange {
        buffer_id: String,
        begin_row: u64,
        end_row: u64,
        row_count: u64,
    },

    /// Context for STRATA-1005 (InvalidRow)
    RowArity {
        buffer_id: String,
        expected: usize,
        actual: usize,
    },

    /// Context for pool errors (STRATA-4001, 4002)
    WorkItem { pool: String, item: String },

    /// Context for STRATA-2002 (QueryTimeout)
    Deadline { query_id: String, timeout_ms: u64 },

    /// Context for STRATA-2006 (SourceFetchFailed)
    SourceFetch {
        source_name: String,
        first_row: u64,
        attempts: u32,
    },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_budget_context_serde_roundtrip() {
        let ctx = ErrorContext::CacheBudget {
            cache_id: "3fa2".to_string(),
            size_bytes: 4096,
            max_size_bytes: 1024,
        };

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"type\":\"cache_budget\""));
        let de: ErrorContext = serde_json::from_str(&json).unwrap();

        match de {
            ErrorContext::CacheBudget {
                size_bytes,
                max_size_bytes,
                ..
            } => {
                assert_eq!(size_bytes, 4096);
                assert_eq!(max_size_bytes, 1024);
            }
            _ => panic!("Wrong variant"),
        }
    }
}
