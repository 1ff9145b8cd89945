// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client connector: one session, one handshake, optional auto-reconnect.
//! See SPEC_FULL.md §4.7.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::{AutoReconnect, ClientConfig},
    endpoint::{
        session::{run_read_loop, ProcedureDispatcher, Session},
        EndpointHandle,
    },
    error::{LastError, RpcError, RpcResult},
    pool::{executor::Executor, IoPool},
    transport::KcpSession,
};

type ConnectCallback = Arc<dyn Fn(Arc<Session>) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(Arc<Session>) + Send + Sync>;
type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

pub struct ClientShared {
    config: ClientConfig,
    pool: IoPool,
    dispatcher: Arc<ProcedureDispatcher>,
    socket: StdMutex<Option<Arc<UdpSocket>>>,
    session: StdMutex<Option<Arc<Session>>>,
    started: AtomicBool,
    auto_reconnect: StdMutex<Option<AutoReconnect>>,
    reconnect_cancel: StdMutex<Option<CancellationToken>>,
    on_init: StdMutex<Option<LifecycleCallback>>,
    on_start: StdMutex<Option<LifecycleCallback>>,
    on_stop: StdMutex<Option<LifecycleCallback>>,
    on_connect: StdMutex<Option<ConnectCallback>>,
    on_disconnect: StdMutex<Option<DisconnectCallback>>,
}

impl std::fmt::Debug for ClientShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientShared")
            .field("server_addr", &self.config.server_addr)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("connected", &self.session.lock().expect("session mutex poisoned").is_some())
            .finish()
    }
}

impl EndpointHandle for ClientShared {
    fn session_count(&self) -> usize {
        usize::from(self.session.lock().expect("session mutex poisoned").is_some())
    }
}

/// A client endpoint: one UDP socket, one session to one server, driven by
/// one pool executor. Mirrors the public operations in SPEC_FULL.md §6
/// specialized to the concrete `ClientConfig`.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new(config: ClientConfig) -> RpcResult<Self> {
        config.validate()?;
        let auto_reconnect = config.auto_reconnect;
        Ok(Self {
            shared: Arc::new(ClientShared {
                pool: IoPool::new(config.endpoint.pool_size),
                config,
                dispatcher: Arc::new(ProcedureDispatcher::new()),
                socket: StdMutex::new(None),
                session: StdMutex::new(None),
                started: AtomicBool::new(false),
                auto_reconnect: StdMutex::new(auto_reconnect),
                reconnect_cancel: StdMutex::new(None),
                on_init: StdMutex::new(None),
                on_start: StdMutex::new(None),
                on_stop: StdMutex::new(None),
                on_connect: StdMutex::new(None),
                on_disconnect: StdMutex::new(None),
            }),
        })
    }

    pub fn bind<Args, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> T + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.shared.dispatcher.bind(name, f);
    }

    pub fn bind_with_session<Args, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Arc<Session>, Args) -> T + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.shared.dispatcher.bind_with_session(name, f);
    }

    pub fn bind_with_endpoint<Args, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Arc<dyn EndpointHandle>, Args) -> T + Send + Sync + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.shared.dispatcher.bind_with_endpoint(name, f);
    }

    pub fn bind_async<Args, Fut, T, F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        Args: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.shared.dispatcher.bind_async(name, f);
    }

    pub fn bind_init(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_init.lock().expect("on_init mutex poisoned") = Some(Arc::new(cb));
    }

    pub fn bind_start(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_start.lock().expect("on_start mutex poisoned") = Some(Arc::new(cb));
    }

    pub fn bind_stop(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_stop.lock().expect("on_stop mutex poisoned") = Some(Arc::new(cb));
    }

    pub fn bind_connect(&self, cb: impl Fn(Arc<Session>) + Send + Sync + 'static) {
        *self.shared.on_connect.lock().expect("on_connect mutex poisoned") = Some(Arc::new(cb));
    }

    pub fn bind_disconnect(&self, cb: impl Fn(Arc<Session>) + Send + Sync + 'static) {
        *self.shared.on_disconnect.lock().expect("on_disconnect mutex poisoned") = Some(Arc::new(cb));
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session.lock().expect("session mutex poisoned").is_some()
    }

    /// Enables or disables reconnect-on-disconnect with the given delay.
    /// Disabling cancels a reconnect attempt already waiting out its delay.
    pub fn auto_reconnect(&self, enabled: bool, delay: std::time::Duration) {
        *self.shared.auto_reconnect.lock().expect("auto_reconnect mutex poisoned") =
            Some(AutoReconnect { enabled, delay_millis: delay.as_millis() as u64 });
        if !enabled {
            if let Some(token) = self.shared.reconnect_cancel.lock().expect("reconnect_cancel mutex poisoned").take() {
                token.cancel();
            }
        }
    }

    /// Binds the UDP socket, starts the pool, and drives the handshake to
    /// completion (or failure) before returning.
    pub async fn async_connect(&self) -> RpcResult<()> {
        LastError::clear();
        let outcome = self.try_connect().await;
        if let Err(ref e) = outcome {
            LastError::set(e.clone());
        }
        outcome
    }

    async fn try_connect(&self) -> RpcResult<()> {
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RpcError::AlreadyStarted);
        }

        if let Some(cb) = self.shared.on_init.lock().expect("on_init mutex poisoned").clone() {
            cb();
        }

        self.shared.pool.start()?;

        let bind_addr: SocketAddr = match self.shared.config.server_addr {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("valid v4 wildcard"),
            SocketAddr::V6(_) => "[::]:0".parse().expect("valid v6 wildcard"),
        };
        let socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?,
        );
        *self.shared.socket.lock().expect("socket mutex poisoned") = Some(Arc::clone(&socket));

        // Handshake and `on_connect` must run on the session's own executor
        // (every callback bound to a session on E runs on E, SPEC_FULL.md
        // §8), not on whichever thread called `connect()`/`async_connect()`.
        let executor = self.shared.pool.get(Some(0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let shared_for_establish = Arc::clone(&self.shared);
        let executor_for_establish = Arc::clone(&executor);
        executor.spawn_async(async move {
            let result = establish_session(&shared_for_establish, &executor_for_establish).await;
            let _ = done_tx.send(result.map(|_| ()));
        });
        done_rx.await.map_err(|_| RpcError::Transport("connect task dropped before completing".into()))??;

        if let Some(cb) = self.shared.on_start.lock().expect("on_start mutex poisoned").clone() {
            cb();
        }
        info!(server_addr = %self.shared.config.server_addr, "client connected");
        Ok(())
    }

    /// Blocking wrapper over [`Client::async_connect`] for callers outside
    /// an async context; requires a multi-threaded `tokio` runtime.
    pub fn connect(&self) -> RpcResult<()> {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.async_connect()))
    }

    fn current_session(&self) -> RpcResult<Arc<Session>> {
        self.shared.session.lock().expect("session mutex poisoned").clone().ok_or(RpcError::NotConnected)
    }

    pub async fn async_call<Args, T>(&self, name: impl Into<String>, args: Args) -> RpcResult<T>
    where
        Args: Serialize,
        T: DeserializeOwned,
    {
        let name = name.into();
        LastError::scope_async(async move { self.current_session()?.async_call(name, args, None).await }).await
    }

    pub fn call<Args, T>(&self, name: impl Into<String>, args: Args) -> RpcResult<T>
    where
        Args: Serialize,
        T: DeserializeOwned,
    {
        LastError::scope(|| self.current_session()?.call(name, args))
    }

    pub fn notify(&self, name: impl Into<String>, args: impl Serialize) -> RpcResult<()> {
        LastError::scope(|| self.current_session()?.notify(name, args))
    }

    pub async fn stop(&self) {
        LastError::clear();
        if self
            .shared
            .started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Some(token) = self.shared.reconnect_cancel.lock().expect("reconnect_cancel mutex poisoned").take() {
            token.cancel();
        }
        if let Some(session) = self.shared.session.lock().expect("session mutex poisoned").take() {
            session.shut_down();
        }
        self.shared.pool.stop().await;
        if let Some(cb) = self.shared.on_stop.lock().expect("on_stop mutex poisoned").clone() {
            cb();
        }
    }
}

/// Drives one handshake attempt to completion, wires the session into the
/// dispatcher/correlator/read-loop, and arms the reconnect-on-disconnect
/// hook. Shared between the first `connect()` and every reconnect attempt.
async fn establish_session(shared: &Arc<ClientShared>, executor: &Arc<Executor>) -> RpcResult<Arc<Session>> {
    let socket = shared
        .socket
        .lock()
        .expect("socket mutex poisoned")
        .clone()
        .expect("socket bound before establish_session is called");

    let kcp = KcpSession::connect(socket, shared.config.server_addr, executor, shared.config.connect_timeout).await?;
    let session = Session::new(
        kcp,
        Arc::clone(executor),
        shared.config.endpoint.max_in_flight_calls,
        shared.config.default_timeout,
        shared.config.endpoint.max_message_size,
    );
    *shared.session.lock().expect("session mutex poisoned") = Some(Arc::clone(&session));

    if session.mark_connected() {
        if let Some(cb) = shared.on_connect.lock().expect("on_connect mutex poisoned").clone() {
            cb(Arc::clone(&session));
        }
    }

    let dispatcher_handle = Arc::clone(&shared.dispatcher);
    let endpoint_handle: Arc<dyn EndpointHandle> = Arc::clone(shared) as Arc<dyn EndpointHandle>;
    let max_message_size = shared.config.endpoint.max_message_size;
    let shared_for_disconnect = Arc::clone(shared);
    let executor_for_disconnect = Arc::clone(executor);

    tokio::spawn(run_read_loop(
        Arc::clone(&session),
        dispatcher_handle,
        endpoint_handle,
        max_message_size,
        None,
        move |session| {
            {
                let mut guard = shared_for_disconnect.session.lock().expect("session mutex poisoned");
                if guard.as_ref().is_some_and(|s| s.id() == session.id()) {
                    *guard = None;
                }
            }
            if let Some(cb) = shared_for_disconnect.on_disconnect.lock().expect("on_disconnect mutex poisoned").clone() {
                cb(Arc::clone(&session));
            }
            let auto = *shared_for_disconnect.auto_reconnect.lock().expect("auto_reconnect mutex poisoned");
            if let Some(ar) = auto {
                if ar.enabled && shared_for_disconnect.started.load(Ordering::SeqCst) {
                    schedule_reconnect(Arc::clone(&shared_for_disconnect), Arc::clone(&executor_for_disconnect), ar.delay());
                }
            }
        },
    ));

    Ok(session)
}

/// Waits out `delay` (cancelable via `shared.reconnect_cancel`), then
/// attempts one more handshake. A failed attempt reschedules itself at the
/// same delay as long as auto-reconnect is still enabled and the client
/// hasn't been stopped -- SPEC_FULL.md §4.7.
fn schedule_reconnect(shared: Arc<ClientShared>, executor: Arc<Executor>, delay: std::time::Duration) {
    let cancel = CancellationToken::new();
    *shared.reconnect_cancel.lock().expect("reconnect_cancel mutex poisoned") = Some(cancel.clone());

    executor.spawn_async(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if !shared.started.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = establish_session(&shared, &executor).await {
            warn!(error = ?e, "reconnect attempt failed");
            let auto_state = *shared.auto_reconnect.lock().expect("auto_reconnect mutex poisoned");
            let still_enabled = auto_state.filter(|ar| ar.enabled);
            if let Some(ar) = still_enabled {
                schedule_reconnect(shared, executor, ar.delay());
            }
        }
    });
}
