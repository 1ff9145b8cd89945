// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use once_cell::sync::OnceCell;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::{
    error::{RpcError, RpcResult},
    pool::{executor::Executor, pending::PendingCounter},
};

static DEFAULT_CONCURRENCY: OnceCell<usize> = OnceCell::new();

fn default_concurrency() -> usize {
    *DEFAULT_CONCURRENCY
        .get_or_init(|| 2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
}

/// Owns a fixed set of [`Executor`]s and starts/stops them as a unit
/// (SPEC_FULL.md §4.1). Executor 0 doubles as the acceptor executor for a
/// server endpoint built on top of this pool.
pub struct IoPool {
    executors: Vec<Arc<Executor>>,
    pending: PendingCounter,
    rr_cursor: AtomicUsize,
    running: AtomicBool,
}

impl IoPool {
    /// `concurrency == 0` is coerced to `2 * hardware concurrency`.
    pub fn new(concurrency: usize) -> Self {
        let n = if concurrency == 0 {
            default_concurrency()
        } else {
            concurrency
        };
        let pending = PendingCounter::new();
        let executors = (0..n).map(|i| Executor::new(i, pending.clone())).collect();
        Self {
            executors,
            pending,
            rr_cursor: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn pending(&self) -> &PendingCounter {
        &self.pending
    }

    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fails with `AlreadyStarted` if running; otherwise spawns one worker
    /// per executor.
    pub fn start(&self) -> RpcResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RpcError::AlreadyStarted);
        }
        for executor in &self.executors {
            if let Err(e) = executor.start() {
                self.running.store(false, Ordering::SeqCst);
                return Err(RpcError::Transport(e.to_string()));
            }
        }
        debug!(executors = self.executors.len(), "io pool started");
        Ok(())
    }

    /// Idempotent; refuses to run (and returns immediately) if called from
    /// within one of the pool's own worker threads, which would self-
    /// deadlock waiting for that very thread to drain.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if self.running_in_pool() {
            warn!("IoPool::stop() called from a pool thread; ignoring");
            return;
        }
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // another caller is already driving the drain.
            return;
        }

        self.pending.wait_zero().await;

        let Some((acceptor, rest)) = self.executors.split_first() else {
            return;
        };

        acceptor.release_guard();
        drain_one(acceptor).await;

        for executor in rest {
            executor.release_guard();
        }
        for executor in rest {
            drain_one(executor).await;
        }

        for executor in &self.executors {
            executor.join();
        }
        debug!("io pool stopped");
    }

    /// Returns executor `index % N`, or advances a round-robin cursor when
    /// `index` is `None` (the `AUTO` sentinel in SPEC_FULL.md §4.1).
    pub fn get(&self, index: Option<usize>) -> Arc<Executor> {
        let n = self.executors.len();
        let i = match index {
            Some(i) => i % n,
            None => self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n,
        };
        Arc::clone(&self.executors[i])
    }

    pub fn running_in_pool(&self) -> bool {
        self.executors.iter().any(|e| e.is_current())
    }

    pub fn running_in_executor(&self, index: usize) -> bool {
        let n = self.executors.len();
        if n == 0 {
            return false;
        }
        self.executors[index % n].is_current()
    }
}

/// Step 3/5 of the drain algorithm: while the executor reports not-stopped,
/// post a cancel-all-timers pass and back off exponentially between 1ms and
/// 10ms. Timers posted by user code after `stop()` began would otherwise
/// keep the executor alive indefinitely; this sweeps up whatever slipped in.
async fn drain_one(executor: &Arc<Executor>) {
    let mut backoff = Duration::from_millis(1);
    while !executor.is_stopped() {
        executor.cancel_all_timers();
        sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(10));
    }
    debug_assert!(
        executor.timers().is_empty(),
        "executor {} still has live timers after drain",
        executor.index()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_twice_yields_already_started() {
        let pool = IoPool::new(1);
        pool.start().expect("first start");
        assert_eq!(pool.start(), Err(RpcError::AlreadyStarted));
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let pool = IoPool::new(1);
        pool.stop().await;
        assert!(!pool.is_started());
    }

    #[tokio::test]
    async fn round_robin_cycles_through_all_executors() {
        let pool = IoPool::new(3);
        pool.start().expect("start");
        let seen: Vec<usize> =
            (0..3).map(|_| pool.get(None).index()).collect::<Vec<_>>();
        assert_eq!(seen, vec![0, 1, 2]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn zero_concurrency_coerced_to_default() {
        let pool = IoPool::new(0);
        assert!(pool.len() >= 1);
    }
}
