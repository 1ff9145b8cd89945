// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy surfaced to callers, plus the thread-local "last error"
//! convenience slot. Internal setup code (config loading, socket binding)
//! keeps composing errors with `anyhow::Context`; at the public boundary
//! those get folded into [`RpcError::Transport`] / [`RpcError::Config`].

use std::{cell::RefCell, future::Future};

use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

/// Error kinds a caller of this crate can observe. See SPEC_FULL.md §7.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// `start()` called while already running.
    #[error("endpoint already started")]
    AlreadyStarted,

    /// Call canceled due to session loss, `stop()`, or explicit cancel.
    #[error("operation aborted")]
    OperationAborted,

    /// No reply arrived within the call's deadline.
    #[error("call timed out")]
    TimedOut,

    /// Request/reply decoding failure, arity mismatch, or type mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested procedure name not registered at the peer.
    #[error("procedure not found: {0}")]
    NotFound(String),

    /// Synchronous `call()` attempted from the session's own executor.
    #[error("call already in progress on this executor")]
    InProgress,

    /// `call()` attempted before the session finished handshaking.
    #[error("session not connected")]
    NotConnected,

    /// The session's in-flight call table is at `max_in_flight_calls`.
    #[error("too many in-flight calls (limit {0})")]
    TooManyInFlightCalls(usize),

    /// Wire data failed structural validation.
    #[error("illegal wire data: {0}")]
    IllegalData(String),

    /// Application-level error embedded by the peer's handler.
    #[error("application error {code}: {message}")]
    Application { code: u16, message: String },

    /// Transport/socket setup failure outside the protocol's control.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<RpcError>> = const { RefCell::new(None) };
}

/// Thread-local convenience slot mirroring the synchronous `last_error`
/// observable described in SPEC_FULL.md §6. Reset at the start of every
/// user-facing operation; prefer the typed `Result` return value over this
/// where possible.
pub struct LastError;

impl LastError {
    /// Clear the slot. Call this at the entry point of any user-facing
    /// operation before it runs.
    pub fn clear() {
        LAST_ERROR.with(|c| *c.borrow_mut() = None);
    }

    /// Record a failure in the slot.
    pub fn set(err: RpcError) {
        LAST_ERROR.with(|c| *c.borrow_mut() = Some(err));
    }

    /// Read back the last recorded failure, if any.
    pub fn get() -> Option<RpcError> {
        LAST_ERROR.with(|c| c.borrow().clone())
    }

    /// Run `op`, recording any error into the slot and returning it unchanged.
    pub fn scope<T>(op: impl FnOnce() -> RpcResult<T>) -> RpcResult<T> {
        Self::clear();
        let res = op();
        if let Err(ref e) = res {
            Self::set(e.clone());
        }
        res
    }

    /// Async counterpart of [`LastError::scope`] for user-facing operations
    /// that can't be expressed as a plain closure.
    pub async fn scope_async<T>(op: impl Future<Output = RpcResult<T>>) -> RpcResult<T> {
        Self::clear();
        let res = op.await;
        if let Err(ref e) = res {
            Self::set(e.clone());
        }
        res
    }
}
