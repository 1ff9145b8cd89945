// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Maps outstanding call ids to waiters, enforcing per-call timeouts. See
//! SPEC_FULL.md §4.5.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    error::{RpcError, RpcResult},
    pool::{executor::Executor, timer::TimerHandle},
    transport::{wire::reply_error, Envelope},
};

struct CallEntry {
    waiter: oneshot::Sender<RpcResult<Envelope>>,
    timer: TimerHandle,
}

/// `M` in SPEC_FULL.md §3: `call_id -> (waiter, timer_handle, decoder)`. The
/// decoder lives one layer up, in the dispatcher's typed `call<T>` wrapper;
/// this table only ever carries raw reply envelopes.
pub struct CallCorrelator {
    executor: Arc<Executor>,
    next_id: AtomicU64,
    table: DashMap<u64, CallEntry>,
    max_in_flight: usize,
}

impl CallCorrelator {
    pub fn new(executor: Arc<Executor>, max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            executor,
            next_id: AtomicU64::new(1),
            table: DashMap::new(),
            max_in_flight,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Allocates the next call id and a timer that fires `on_timeout` after
    /// `timeout`. Returns `too_many_in_flight_calls` immediately (no
    /// allocation, no queuing) when the table is already at capacity --
    /// SPEC_FULL.md §4.5's resolved bounded-table Open Question.
    pub fn begin_call(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> RpcResult<(u64, oneshot::Receiver<RpcResult<Envelope>>)> {
        if self.table.len() >= self.max_in_flight {
            return Err(RpcError::TooManyInFlightCalls(self.max_in_flight));
        }

        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, receiver) = oneshot::channel();

        let this = Arc::clone(self);
        let timer = self.executor.schedule_timer(timeout, move || {
            this.on_timeout(call_id);
        });

        self.table.insert(call_id, CallEntry { waiter, timer });
        Ok((call_id, receiver))
    }

    /// Delivers a reply. A reply for an id with no matching entry is a late
    /// or duplicate reply and is silently discarded.
    pub fn on_reply(&self, call_id: u64, envelope: Envelope) {
        let Some((_, entry)) = self.table.remove(&call_id) else {
            trace!(call_id, "discarding reply for unknown/expired call");
            return;
        };
        entry.timer.cancel(self.executor.timers());
        let result = if envelope.is_ok_reply() {
            Ok(envelope)
        } else {
            let message = String::from_utf8_lossy(&envelope.payload).into_owned();
            Err(match envelope.err_code {
                reply_error::NOT_FOUND => RpcError::NotFound(message),
                reply_error::INVALID_ARGUMENT => RpcError::InvalidArgument(message),
                code => RpcError::Application { code, message },
            })
        };
        let _ = entry.waiter.send(result);
    }

    fn on_timeout(&self, call_id: u64) {
        if let Some((_, entry)) = self.table.remove(&call_id) {
            let _ = entry.waiter.send(Err(RpcError::TimedOut));
        }
    }

    /// Explicit cancellation; completes the waiter with `operation_aborted`.
    pub fn cancel(&self, call_id: u64) {
        if let Some((_, entry)) = self.table.remove(&call_id) {
            entry.timer.cancel(self.executor.timers());
            let _ = entry.waiter.send(Err(RpcError::OperationAborted));
        }
    }

    /// Completes every outstanding waiter with `operation_aborted` and
    /// clears the table. Called on session loss and on `stop()`.
    pub fn on_session_lost(&self) {
        let call_ids: Vec<u64> = self.table.iter().map(|entry| *entry.key()).collect();
        for call_id in call_ids {
            if let Some((_, entry)) = self.table.remove(&call_id) {
                entry.timer.cancel(self.executor.timers());
                let _ = entry.waiter.send(Err(RpcError::OperationAborted));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::pool::PendingCounter;

    fn test_executor() -> Arc<Executor> {
        let executor = Executor::new(0, PendingCounter::new());
        executor.start().expect("start executor");
        executor
    }

    #[tokio::test]
    async fn reply_completes_waiter_and_removes_entry() {
        let correlator = CallCorrelator::new(test_executor(), 8);
        let (call_id, receiver) = correlator.begin_call(Duration::from_secs(5)).expect("begin_call");
        correlator.on_reply(call_id, Envelope::reply_ok(call_id, Bytes::from_static(b"ok")));
        let reply = receiver.await.expect("waiter dropped").expect("ok reply");
        assert_eq!(reply.payload, Bytes::from_static(b"ok"));
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn application_error_reply_surfaces_as_application_error() {
        let correlator = CallCorrelator::new(test_executor(), 8);
        let (call_id, receiver) = correlator.begin_call(Duration::from_secs(5)).expect("begin_call");
        correlator.on_reply(
            call_id,
            Envelope::reply_err(call_id, 7, Bytes::from_static(b"bad")),
        );
        let err = receiver.await.expect("waiter dropped").expect_err("error reply");
        assert_eq!(err, RpcError::Application { code: 7, message: "bad".into() });
    }

    #[tokio::test]
    async fn timeout_completes_waiter_with_timed_out() {
        let correlator = CallCorrelator::new(test_executor(), 8);
        let (_call_id, receiver) = correlator.begin_call(Duration::from_millis(20)).expect("begin_call");
        let err = receiver.await.expect("waiter dropped").expect_err("timeout");
        assert_eq!(err, RpcError::TimedOut);
    }

    #[tokio::test]
    async fn full_table_rejects_immediately() {
        let correlator = CallCorrelator::new(test_executor(), 1);
        let _held = correlator.begin_call(Duration::from_secs(5)).expect("first call");
        let second = correlator.begin_call(Duration::from_secs(5));
        assert_eq!(second.err(), Some(RpcError::TooManyInFlightCalls(1)));
    }

    #[tokio::test]
    async fn session_lost_aborts_all_outstanding_calls() {
        let correlator = CallCorrelator::new(test_executor(), 8);
        let (_id1, rx1) = correlator.begin_call(Duration::from_secs(5)).expect("call 1");
        let (_id2, rx2) = correlator.begin_call(Duration::from_secs(5)).expect("call 2");
        correlator.on_session_lost();
        assert_eq!(rx1.await.expect("waiter dropped").err(), Some(RpcError::OperationAborted));
        assert_eq!(rx2.await.expect("waiter dropped").err(), Some(RpcError::OperationAborted));
        assert_eq!(correlator.in_flight(), 0);
    }
}
