//! Counting completion barrier.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

type Callback = Box<dyn FnOnce() + Send>;

/// Fires a callback exactly once, when the last of `parties` arrivals lands.
///
/// Arrival order is irrelevant. Arrivals past the count are ignored.
pub struct CompletionBarrier {
    remaining: AtomicUsize,
    on_complete: Mutex<Option<Callback>>,
}

impl CompletionBarrier {
    pub fn new(parties: usize, on_complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remaining: AtomicUsize::new(parties),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        }
    }

    /// Record one arrival. Returns true if this arrival fired the callback.
    pub fn arrive(&self) -> bool {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev != Ok(1) {
            return false;
        }
        let callback = match self.on_complete.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counting() -> (Arc<AtomicUsize>, CompletionBarrier) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let barrier = CompletionBarrier::new(2, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        (fired, barrier)
    }

    #[test]
    fn test_fires_on_second_arrival_only() {
        let (fired, barrier) = counting();
        assert!(!barrier.arrive());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!barrier.is_complete());
        assert!(barrier.arrive());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(barrier.is_complete());
    }

    #[test]
    fn test_extra_arrivals_ignored() {
        let (fired, barrier) = counting();
        barrier.arrive();
        barrier.arrive();
        assert!(!barrier.arrive());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_arrivals_fire_once() {
        for _ in 0..50 {
            let (fired, barrier) = counting();
            let barrier = Arc::new(barrier);
            let a = tokio::spawn({
                let b = barrier.clone();
                async move { b.arrive() }
            });
            let b = tokio::spawn({
                let b = barrier.clone();
                async move { b.arrive() }
            });
            let (a, b) = (a.await.unwrap(), b.await.unwrap());
            assert!(a ^ b);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }
}
