// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::{
    runtime::{Builder, Handle},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pool::{
    pending::PendingCounter,
    timer::{TimerHandle, TimerRegistry},
};

/// A unit of work submitted to an executor's serializer. Closures run to
/// completion, one at a time, in submission order -- this is the strand
/// (SPEC_FULL.md §3: "S_E serializes them").
type Job = Box<dyn FnOnce() + Send + 'static>;

/// One single-threaded executor: a dedicated OS thread driving a
/// `tokio::runtime::Runtime` built with `new_current_thread`. Every
/// session/timer/acceptor bound to this executor only ever touches its
/// state from callbacks run here.
pub struct Executor {
    index: usize,
    timers: TimerRegistry,
    pending: PendingCounter,
    post_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    guard_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<Handle>>,
    thread_id: Mutex<Option<ThreadId>>,
    join: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Executor {
    pub(crate) fn new(index: usize, pending: PendingCounter) -> Arc<Self> {
        Arc::new(Self {
            index,
            timers: TimerRegistry::new(),
            pending,
            post_tx: Mutex::new(None),
            guard_tx: Mutex::new(None),
            handle: Mutex::new(None),
            thread_id: Mutex::new(None),
            join: Mutex::new(None),
            stopped: AtomicBool::new(true),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn pending(&self) -> &PendingCounter {
        &self.pending
    }

    /// Spawns the worker thread and its runtime. Idempotent only in the
    /// sense that the caller (the pool) is responsible for not calling this
    /// twice without an intervening `stop`.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        let (post_tx, mut post_rx) = mpsc::unbounded_channel::<Job>();
        let (guard_tx, mut guard_rx) = mpsc::channel::<()>(1);
        *self.post_tx.lock().expect("post_tx mutex poisoned") = Some(post_tx);
        *self.guard_tx.lock().expect("guard_tx mutex poisoned") = Some(guard_tx);
        self.stopped.store(false, Ordering::SeqCst);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<Handle>>();
        let this = Arc::clone(self);
        let join = thread::Builder::new()
            .name(format!("kcp-rpc-exec-{}", self.index))
            .spawn(move || {
                let rt = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    },
                };
                *this.thread_id.lock().expect("thread_id mutex poisoned") =
                    Some(thread::current().id());
                let _ = ready_tx.send(Ok(rt.handle().clone()));

                rt.block_on(async move {
                    loop {
                        tokio::select! {
                            guard = guard_rx.recv() => {
                                if guard.is_none() {
                                    break;
                                }
                            }
                            job = post_rx.recv() => {
                                match job {
                                    Some(job) => job(),
                                    None => break,
                                }
                            }
                        }
                    }
                });

                this.stopped.store(true, Ordering::SeqCst);
                debug!(executor = this.index, "executor run loop exited");
            })
            .context("failed to spawn executor thread")?;

        let handle = ready_rx
            .recv()
            .context("executor thread init channel closed before signalling ready")??;
        *self.handle.lock().expect("handle mutex poisoned") = Some(handle);
        *self.join.lock().expect("join mutex poisoned") = Some(join);
        Ok(())
    }

    /// Releases this executor's work-guard. Once released (and once any
    /// remaining posted work drains), the run loop's `select!` observes the
    /// guard channel close and the executor is free to stop.
    pub(crate) fn release_guard(&self) {
        *self.guard_tx.lock().expect("guard_tx mutex poisoned") = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn join(&self) {
        if let Some(j) = self.join.lock().expect("join mutex poisoned").take() {
            let _ = j.join();
        }
    }

    /// Posts a synchronous closure onto this executor's serializer. Runs in
    /// FIFO submission order relative to other `post`ed closures. Tracked in
    /// `P_E` from submission until the job's finally-path (its `Drop`,
    /// win or lose) so a concurrent `IoPool::stop()` drain never observes a
    /// false "quiescent" reading (SPEC_FULL.md §3, "Pending Counter").
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let guard = self.pending.track();
        let job = Box::new(move || {
            job();
            drop(guard);
        });
        let guard = self.post_tx.lock().expect("post_tx mutex poisoned");
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    warn!(executor = self.index, "post to stopped executor dropped");
                }
            },
            None => warn!(executor = self.index, "post to unstarted executor dropped"),
        }
    }

    /// Spawns a future onto this executor's runtime. Unlike `post`, futures
    /// spawned this way may interleave with each other at `.await` points --
    /// acceptable per SPEC_FULL.md §5, which only forbids blocking the
    /// worker thread, not interleaving of suspended work. Tracked in `P_E`
    /// for the same reason as `post`.
    pub fn spawn_async<F>(&self, fut: F)
    where F: Future<Output = ()> + Send + 'static {
        let guard = self.pending.track();
        let handle = self.handle.lock().expect("handle mutex poisoned").clone();
        match handle {
            Some(h) => {
                h.spawn(async move {
                    fut.await;
                    drop(guard);
                });
            },
            None => warn!(executor = self.index, "spawn_async on unstarted executor"),
        }
    }

    /// True if the current OS thread is this executor's worker thread.
    pub fn is_current(&self) -> bool {
        let current = thread::current().id();
        self.thread_id
            .lock()
            .expect("thread_id mutex poisoned")
            .is_some_and(|id| id == current)
    }

    /// Schedules `callback` to run on this executor's serializer after
    /// `delay`, registering it in `T_E` so that an endpoint-wide shutdown
    /// can cancel it even if nobody holds the returned handle.
    pub fn schedule_timer(
        self: &Arc<Self>,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let token = CancellationToken::new();
        let id = self.timers.save(token.clone());
        let exec = Arc::clone(self);
        let fire_token = token.clone();
        self.spawn_async(async move {
            tokio::select! {
                _ = fire_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    exec.timers.forget(id);
                    exec.post(callback);
                }
            }
        });
        TimerHandle::new(id, token)
    }

    /// Posts a single pass that cancels every timer currently live on this
    /// executor. Used by the drain loop to sweep up stragglers.
    pub fn cancel_all_timers(&self) {
        self.timers.cancel_all();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("index", &self.index)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Convenience used by callers that need to fail fast instead of logging a
/// dropped post; kept separate from `post` because most call sites (timer
/// fire, reply delivery) cannot meaningfully propagate an error.
pub fn require_started(executor: &Executor) -> Result<()> {
    if executor.is_stopped() {
        bail!("executor {} is not started", executor.index());
    }
    Ok(())
}
