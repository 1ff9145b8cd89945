// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Registry of named procedures with typed argument/result adapters. See
//! SPEC_FULL.md §4.6.
//!
//! Positional arguments are carried as a JSON array (`serde_json`, the
//! bundled default codec per SPEC_FULL.md §6); deserializing into an
//! `Args` tuple of the wrong length is exactly the `invalid_argument`
//! arity mismatch the round-trip laws in SPEC_FULL.md §8 require.

use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::{
    error::{RpcError, RpcResult},
    transport::{wire::reply_error, Direction, Envelope},
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Back-references a handler may ask for, alongside its decoded arguments.
/// `S`/`E` are the endpoint's session/endpoint handle types -- the
/// dispatcher itself stays agnostic of them to avoid a dependency on the
/// endpoint layer (SPEC_FULL.md's "leaves first" component ordering).
pub struct HandlerContext<S, E> {
    pub session: Option<S>,
    pub endpoint: Option<E>,
}

impl<S, E> HandlerContext<S, E> {
    pub fn new(session: Option<S>, endpoint: Option<E>) -> Self {
        Self { session, endpoint }
    }
}

impl<S: Clone, E: Clone> Clone for HandlerContext<S, E> {
    fn clone(&self) -> Self {
        Self { session: self.session.clone(), endpoint: self.endpoint.clone() }
    }
}

type RawHandler<S, E> =
    Arc<dyn Fn(HandlerContext<S, E>, Bytes) -> BoxFuture<RpcResult<Bytes>> + Send + Sync>;

fn decode_args<Args: DeserializeOwned>(payload: &[u8]) -> RpcResult<Args> {
    serde_json::from_slice(payload).map_err(|e| RpcError::InvalidArgument(e.to_string()))
}

fn encode_result<T: Serialize>(value: &T) -> RpcResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| RpcError::InvalidArgument(e.to_string()))
}

/// `name -> (decoder, invoker, encoder)`, collapsed into one boxed closure
/// per entry. Procedures are immutable after binding (SPEC_FULL.md §3).
pub struct Dispatcher<S, E> {
    procedures: DashMap<String, RawHandler<S, E>>,
}

impl<S, E> Default for Dispatcher<S, E> {
    fn default() -> Self {
        Self { procedures: DashMap::new() }
    }
}

impl<S, E> Dispatcher<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    /// Shape 1: a free procedure of typed args returning `T`.
    pub fn bind<Args, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> T + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.procedures.insert(
            name.into(),
            Arc::new(move |_ctx: HandlerContext<S, E>, payload: Bytes| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let args: Args = decode_args(&payload)?;
                    encode_result(&f(args))
                }) as BoxFuture<RpcResult<Bytes>>
            }),
        );
    }

    /// Shape 2: a free procedure whose first argument is a session
    /// back-reference.
    pub fn bind_with_session<Args, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(S, Args) -> T + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.procedures.insert(
            name.into(),
            Arc::new(move |ctx: HandlerContext<S, E>, payload: Bytes| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let session = ctx
                        .session
                        .ok_or_else(|| RpcError::Transport("handler requires a session context".into()))?;
                    let args: Args = decode_args(&payload)?;
                    encode_result(&f(session, args))
                }) as BoxFuture<RpcResult<Bytes>>
            }),
        );
    }

    /// Shape 3: a free procedure whose first argument is an endpoint
    /// back-reference.
    pub fn bind_with_endpoint<Args, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(E, Args) -> T + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.procedures.insert(
            name.into(),
            Arc::new(move |ctx: HandlerContext<S, E>, payload: Bytes| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let endpoint = ctx
                        .endpoint
                        .ok_or_else(|| RpcError::Transport("handler requires an endpoint context".into()))?;
                    let args: Args = decode_args(&payload)?;
                    encode_result(&f(endpoint, args))
                }) as BoxFuture<RpcResult<Bytes>>
            }),
        );
    }

    /// Shape 4: a procedure returning a future of `T`, awaited on the same
    /// executor before the reply is encoded.
    pub fn bind_async<Args, Fut, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.procedures.insert(
            name.into(),
            Arc::new(move |_ctx: HandlerContext<S, E>, payload: Bytes| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let args: Args = decode_args(&payload)?;
                    let result = f(args).await;
                    encode_result(&result)
                }) as BoxFuture<RpcResult<Bytes>>
            }),
        );
    }

    /// Runs `request` through its bound procedure and returns the reply
    /// frame to send back, or `None` for a fire-and-forget notification
    /// (steps 3-4 of SPEC_FULL.md §4.6 are skipped for those).
    pub async fn dispatch(&self, request: &Envelope, ctx: HandlerContext<S, E>) -> Option<Envelope> {
        let is_notify = request.direction == Direction::Notify;
        let handler = self.procedures.get(&request.name).map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            if is_notify {
                warn!(name = %request.name, "dropping notify for unbound procedure");
                return None;
            }
            return Some(Envelope::reply_err(
                request.call_id,
                reply_error::NOT_FOUND,
                Bytes::from(request.name.clone()),
            ));
        };

        let outcome = handler(ctx, request.payload.clone()).await;
        if is_notify {
            return None;
        }

        Some(match outcome {
            Ok(payload) => Envelope::reply_ok(request.call_id, payload),
            Err(RpcError::InvalidArgument(msg)) => {
                Envelope::reply_err(request.call_id, reply_error::INVALID_ARGUMENT, Bytes::from(msg))
            },
            Err(e) => Envelope::reply_err(request.call_id, reply_error::INTERNAL, Bytes::from(e.to_string())),
        })
    }
}
