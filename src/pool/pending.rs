// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::time::{Duration, sleep};

/// Process-wide count of in-flight asynchronously dispatched events for one
/// pool. The pool refuses to consider itself drained while this is above
/// zero (SPEC_FULL.md §3, "Pending Counter").
#[derive(Debug, Clone, Default)]
pub struct PendingCounter(Arc<AtomicUsize>);

/// RAII guard returned by [`PendingCounter::track`]; decrements the counter
/// when a nested post's "finally path" runs, i.e. on drop.
pub struct PendingGuard(PendingCounter);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment for the duration of a nested scheduled callback; decrements
    /// automatically when the returned guard is dropped.
    #[must_use]
    pub fn track(&self) -> PendingGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        PendingGuard(self.clone())
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Busy-poll with yield until the counter reaches zero, as mandated by
    /// the drain algorithm in SPEC_FULL.md §4.1 step 1.
    pub async fn wait_zero(&self) {
        while self.get() > 0 {
            sleep(Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_zero_returns_once_guard_dropped() {
        let counter = PendingCounter::new();
        let guard = counter.track();
        assert_eq!(counter.get(), 1);
        drop(guard);
        counter.wait_zero().await;
        assert_eq!(counter.get(), 0);
    }
}
