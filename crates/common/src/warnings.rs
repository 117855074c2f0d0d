//! # Query Warnings
//!
//! Per-query collection of non-fatal warnings (spill high-water marks,
//! cache bypasses, retried fetches) that travel back to the caller on the
//! batches of the query that raised them.

use parking_lot::Mutex;
use std::sync::Arc;

/// Shared, cloneable warning sink owned by one query.
#[derive(Debug, Clone, Default)]
pub struct WarningCollector {
    inner: Arc<Mutex<Vec<String>>>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a warning; duplicates of the last pending warning are dropped.
    pub fn add(&self, warning: impl Into<String>) {
        let warning = warning.into();
        let mut lock = self.inner.lock();
        if lock.last() != Some(&warning) {
            lock.push(warning);
        }
    }

    /// Drain every pending warning.
    pub fn take_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_warnings() {
        let collector = WarningCollector::new();
        let other = collector.clone();
        other.add("spilled buffer 3");
        other.add("spilled buffer 3");
        collector.add("cache bypassed");

        assert_eq!(
            collector.take_all(),
            vec!["spilled buffer 3".to_string(), "cache bypassed".to_string()]
        );
        assert!(other.is_empty());
    }
}
