use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_error::{Result, StrataError};

use crate::pool::WorkHandle;

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<StrataError>>,
    work: Mutex<Vec<WorkHandle>>,
}

/// Plan-wide cancellation flag.
///
/// Cancelling propagates to every work item registered with the token.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel_with(StrataError::cancelled("Query cancelled by caller"));
    }

    /// Cancel with a specific reason. The first reason wins.
    pub fn cancel_with(&self, reason: StrataError) {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.cancelled.store(true, Ordering::Release);
        let work = std::mem::take(&mut *self.inner.work.lock());
        for handle in work {
            handle.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<StrataError> {
        self.inner.reason.lock().clone()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(self
                .reason()
                .unwrap_or_else(|| StrataError::cancelled("Query cancelled")))
        } else {
            Ok(())
        }
    }

    /// Track a work item so cancelling the plan also cancels it.
    pub fn register(&self, handle: &WorkHandle) {
        if self.is_cancelled() {
            handle.cancel();
            return;
        }
        let mut work = self.inner.work.lock();
        work.retain(|h| !h.state().is_finished());
        work.push(handle.clone());
        drop(work);
        // cancel_with may have drained the list between the check and the push
        if self.is_cancelled() {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_error::ErrorCode;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel_with(StrataError::new(ErrorCode::QueryTimeout, "deadline"));
        token.cancel();
        assert_eq!(token.check().unwrap_err().code, ErrorCode::QueryTimeout);
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.reason().unwrap().code, ErrorCode::QueryCancelled);
    }
}
