// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server acceptor: one acceptor executor, sessions assigned round-robin
//! across the rest of the pool. See SPEC_FULL.md §4.7.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::{
    cfg::config::{ServerConfig, DEFAULT_CALL_TIMEOUT},
    endpoint::{
        session::{run_read_loop, ProcedureDispatcher, Session},
        EndpointHandle,
    },
    error::{LastError, RpcError, RpcResult},
    pool::IoPool,
    transport::Demultiplexer,
};

type ConnectCallback = Arc<dyn Fn(Arc<Session>) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(Arc<Session>) + Send + Sync>;
type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

pub struct ServerShared {
    config: ServerConfig,
    pool: IoPool,
    dispatcher: Arc<ProcedureDispatcher>,
    sessions: DashMap<u64, Arc<Session>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    started: AtomicBool,
    on_init: StdMutex<Option<LifecycleCallback>>,
    on_start: StdMutex<Option<LifecycleCallback>>,
    on_stop: StdMutex<Option<LifecycleCallback>>,
    on_connect: StdMutex<Option<ConnectCallback>>,
    on_disconnect: StdMutex<Option<DisconnectCallback>>,
}

impl std::fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerShared")
            .field("bind_addr", &self.config.bind_addr)
            .field("sessions", &self.sessions.len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl EndpointHandle for ServerShared {
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// A server endpoint: one UDP socket, one acceptor, N pool executors. Mirrors
/// the public operations in SPEC_FULL.md §6 specialized to the concrete
/// `ServerConfig` (which already carries `bind_addr`).
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> RpcResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ServerShared {
                pool: IoPool::new(config.endpoint.pool_size),
                config,
                dispatcher: Arc::new(ProcedureDispatcher::new()),
                sessions: DashMap::new(),
                local_addr: StdMutex::new(None),
                started: AtomicBool::new(false),
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

    pub fn is_stopped(&self) -> bool {
        !self.is_started()
    }

    pub fn get_session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// The socket's actual bound address. Populated once `async_start`
    /// succeeds; useful when `BindAddress` used an ephemeral port (`:0`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().expect("local_addr mutex poisoned")
    }

    /// Binds the UDP socket, starts the pool, and spawns the acceptor loop
    /// on executor 0.
    pub async fn async_start(&self) -> RpcResult<()> {
        LastError::clear();
        let outcome = self.try_start().await;
        if let Err(ref e) = outcome {
            LastError::set(e.clone());
        }
        outcome
    }

    async fn try_start(&self) -> RpcResult<()> {
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

        let socket = UdpSocket::bind(self.shared.config.bind_addr)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let bound_addr = socket.local_addr().map_err(|e| RpcError::Transport(e.to_string()))?;
        *self.shared.local_addr.lock().expect("local_addr mutex poisoned") = Some(bound_addr);
        let demux = Demultiplexer::new(Arc::new(socket));
        let acceptor_executor = self.shared.pool.get(Some(0));

        let max_message_size = self.shared.config.endpoint.max_message_size;
        let max_in_flight_calls = self.shared.config.endpoint.max_in_flight_calls;
        let max_sessions = self.shared.config.max_sessions as usize;
        let shared = Arc::clone(&self.shared);
        let shared_for_select = Arc::clone(&shared);
        let demux_for_accept = Arc::clone(&demux);

        acceptor_executor.spawn_async(async move {
            let shared_for_accept = Arc::clone(&shared);
            demux
                .run_acceptor(
                    move || shared_for_select.pool.get(None),
                    move |kcp_session, executor| {
                        let shared = Arc::clone(&shared_for_accept);

                        if max_sessions != 0 && shared.sessions.len() >= max_sessions {
                            warn!(
                                peer = %kcp_session.peer_addr(),
                                max_sessions,
                                "rejecting session, server at capacity"
                            );
                            demux_for_accept.remove(kcp_session.peer_addr());
                            kcp_session.close();
                            return;
                        }

                        let session =
                            Session::new(kcp_session, executor, max_in_flight_calls, DEFAULT_CALL_TIMEOUT, max_message_size);
                        shared.sessions.insert(session.id(), Arc::clone(&session));

                        if session.mark_connected() {
                            if let Some(cb) = shared.on_connect.lock().expect("on_connect mutex poisoned").clone() {
                                cb(Arc::clone(&session));
                            }
                        }

                        let dispatcher_handle = Arc::clone(&shared.dispatcher);
                        let endpoint_handle: Arc<dyn EndpointHandle> = Arc::clone(&shared) as Arc<dyn EndpointHandle>;
                        let shared_for_disconnect = Arc::clone(&shared);
                        tokio::spawn(run_read_loop(
                            session,
                            dispatcher_handle,
                            endpoint_handle,
                            max_message_size,
                            None,
                            move |session| {
                                shared_for_disconnect.sessions.remove(&session.id());
                                if let Some(cb) =
                                    shared_for_disconnect.on_disconnect.lock().expect("on_disconnect mutex poisoned").clone()
                                {
                                    cb(session);
                                }
                            },
                        ));
                    },
                    move |peer, data| {
                        warn!(peer = %peer, len = data.len(), "illegal datagram with no matching session");
                    },
                )
                .await;
        });

        if let Some(cb) = self.shared.on_start.lock().expect("on_start mutex poisoned").clone() {
            cb();
        }
        info!(bind_addr = %bound_addr, "server started");
        Ok(())
    }

    /// Blocking wrapper over [`Server::async_start`] for callers outside an
    /// async context; requires a multi-threaded `tokio` runtime.
    pub fn start(&self) -> RpcResult<()> {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.async_start()))
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
        for entry in self.shared.sessions.iter() {
            entry.value().shut_down();
        }
        self.shared.sessions.clear();
        self.shared.pool.stop().await;
        if let Some(cb) = self.shared.on_stop.lock().expect("on_stop mutex poisoned").clone() {
            cb();
        }
    }
}
