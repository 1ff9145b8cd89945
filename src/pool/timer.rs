// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-executor set of live timers (T_E in SPEC_FULL.md §3). `save`/`forget`
/// are safe to call from any thread: `DashMap` gives the same "no data
/// races" guarantee the teacher gets by routing through a strand, without
/// needing a round-trip post for every timer bookkeeping op.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    next_id: AtomicU64,
    live: DashMap<u64, CancellationToken>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a timer's cancellation token, returning its id.
    pub fn save(&self, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, token);
        id
    }

    /// Removes a timer on fire or explicit cancel. A double forget is a
    /// no-op, matching the "double cancel is a no-op" invariant.
    pub fn forget(&self, id: u64) {
        self.live.remove(&id);
    }

    /// Cancels every timer currently registered. Each canceled timer removes
    /// itself via `forget` on its own cancel callback, so this only needs to
    /// flip the tokens; it does not need to clear the map itself.
    pub fn cancel_all(&self) {
        for entry in self.live.iter() {
            entry.value().cancel();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}

/// A single registered timer: (executor, deadline, callback) per SPEC_FULL.md
/// §3. Cancellation is cooperative via a `CancellationToken`; firing and
/// cancellation are mutually exclusive outcomes enforced by `tokio::select!`
/// in the task that owns the actual sleep.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    token: CancellationToken,
}

impl TimerHandle {
    pub(crate) fn new(id: u64, token: CancellationToken) -> Self {
        Self { id, token }
    }

    /// Cancels the timer. Idempotent: canceling an already-fired or
    /// already-canceled timer is a no-op.
    pub fn cancel(&self, registry: &TimerRegistry) {
        if !self.token.is_cancelled() {
            self.token.cancel();
        }
        registry.forget(self.id);
        debug!(timer_id = self.id, "timer canceled");
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}
