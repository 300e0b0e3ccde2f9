//! Cooperative cancellation
//!
//! Running tasks are never interrupted. The scheduler raises a token and the
//! task observes it at its own checkpoints, usually through
//! [`TaskContext::report_progress`](crate::TaskContext::report_progress).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared cancellation flag for one process
///
/// Clones observe the same flag.
///
/// # Example
///
/// ```
/// use bgproc_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let task_token = token.clone();
///
/// assert!(token.cancel());
/// assert!(task_token.is_cancelled());
/// // Raising it again is a no-op.
/// assert!(!token.cancel());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag
    ///
    /// Returns `true` if this call raised it, `false` if it was already raised.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_token_starts_clear() {
        assert!(!CancellationToken::new().is_cancelled());
        assert!(!CancellationToken::default().is_cancelled());
    }

    #[test]
    fn test_clones_share_flag() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token2.cancel();
        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_cancel_reports_first_raise_only() {
        let token = CancellationToken::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_visible_across_threads() {
        let token = CancellationToken::new();
        let observer = token.clone();

        let handle = thread::spawn(move || {
            while !observer.is_cancelled() {
                thread::yield_now();
            }
        });

        token.cancel();
        handle.join().unwrap();
    }
}
