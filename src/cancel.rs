use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Token through which a caller cancels a running evaluation.
///
/// Clone is cheap and every clone observes the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Running node functions observe it at their next
    /// [`check_interrupted`](crate::Environment::check_interrupted), and no new
    /// node is started.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[test]
fn test_clones_share_cancellation() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    token.cancel();
    assert!(clone.is_cancelled());
}
