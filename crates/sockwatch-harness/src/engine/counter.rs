use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of requests currently inside the server's delay window.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    count: AtomicUsize,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value after the increment.
    pub fn increment(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the value after the decrement. Never goes below zero.
    pub fn decrement(&self) -> usize {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn snapshot(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Counts a request in and hands back the slot that counts it out.
    pub fn enter(self: &Arc<Self>) -> InFlight {
        let value = self.increment();
        InFlight {
            counter: Arc::clone(self),
            value_on_entry: value,
            settled: false,
        }
    }
}

/// One request's share of [`ActiveRequests`].
///
/// Dropping the slot releases it, so every exit path of a handler is
/// accounted for unless [`InFlight::leak`] is called.
pub struct InFlight {
    counter: Arc<ActiveRequests>,
    value_on_entry: usize,
    settled: bool,
}

impl InFlight {
    pub fn value_on_entry(&self) -> usize {
        self.value_on_entry
    }

    /// Releases the slot, returning the remaining count.
    pub fn release(mut self) -> usize {
        self.settled = true;
        self.counter.decrement()
    }

    /// Gives up the slot without decrementing.
    pub fn leak(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.settled {
            self.counter.decrement();
        }
    }
}
