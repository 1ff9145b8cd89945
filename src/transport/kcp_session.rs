// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The reliable-ordered byte stream on top of a UDP socket: conversation-id
//! handshake, ticking the `kcp` crate's state machine, and demultiplexing
//! inbound datagrams by peer address. See SPEC_FULL.md §4.4.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use kcp::Kcp;
use rand::Rng;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{RpcError, RpcResult},
    pool::executor::Executor,
};

const HELLO_MAGIC: &[u8; 4] = b"KRH1";
const HELLO_LEN: usize = 8;
const HELLO_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const KCP_TICK_INTERVAL: Duration = Duration::from_millis(20);
const RECV_SCRATCH_LEN: usize = 64 * 1024;

fn encode_hello(conv: u32) -> [u8; HELLO_LEN] {
    let mut out = [0u8; HELLO_LEN];
    out[..4].copy_from_slice(HELLO_MAGIC);
    out[4..].copy_from_slice(&conv.to_be_bytes());
    out
}

fn decode_hello(bytes: &[u8]) -> Option<u32> {
    if bytes.len() == HELLO_LEN && &bytes[..4] == HELLO_MAGIC {
        Some(u32::from_be_bytes(bytes[4..8].try_into().expect("checked len above")))
    } else {
        None
    }
}

/// A random, non-zero conversation id. `0` is reserved per SPEC_FULL.md §4.4.
pub fn random_conv() -> u32 {
    loop {
        let conv: u32 = rand::rng().random();
        if conv != 0 {
            return conv;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Init,
    Handshaking,
    Connected,
    Disconnecting,
    Closed,
}

/// `kcp::Kcp`'s output sink: queues encoded segments for the tick loop to
/// flush to the real socket. `Kcp::output` is called synchronously from
/// inside `send`/`input`/`update`, all of which only ever run on the
/// session's own executor, so a plain `std::sync::Mutex` around the queue
/// is never contended.
struct KcpOutput {
    queue: Arc<StdMutex<VecDeque<Vec<u8>>>>,
}

impl io::Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue
            .lock()
            .expect("kcp output queue poisoned")
            .push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One peer's reliable-ordered byte stream. Exposes `send`/`recv`/`close`
/// per SPEC_FULL.md §4.4; framing and RPC semantics are layered on top by
/// the endpoint.
pub struct KcpSession {
    conv: u32,
    peer_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    kcp: StdMutex<Kcp<KcpOutput>>,
    out_queue: Arc<StdMutex<VecDeque<Vec<u8>>>>,
    status: StdMutex<SessionStatus>,
    started_at: Instant,
    recv_tx: mpsc::UnboundedSender<Bytes>,
    recv_rx: StdMutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    connected_tx: StdMutex<Option<oneshot::Sender<()>>>,
    cancel: CancellationToken,
}

impl KcpSession {
    fn new(conv: u32, peer_addr: SocketAddr, socket: Arc<UdpSocket>, status: SessionStatus) -> Arc<Self> {
        let out_queue = Arc::new(StdMutex::new(VecDeque::new()));
        let output = KcpOutput { queue: Arc::clone(&out_queue) };
        let mut kcp = Kcp::new(conv, output);
        kcp.set_nodelay(true, KCP_TICK_INTERVAL.as_millis() as i32, 2, true);
        kcp.set_wndsize(256, 256);
        let _ = kcp.set_mtu(1400);
        kcp.update(0).ok();

        let (recv_tx, recv_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            conv,
            peer_addr,
            socket,
            kcp: StdMutex::new(kcp),
            out_queue,
            status: StdMutex::new(status),
            started_at: Instant::now(),
            recv_tx,
            recv_rx: StdMutex::new(Some(recv_rx)),
            connected_tx: StdMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().expect("status mutex poisoned")
    }

    /// Client-side constructor. Drives the `KRH1` handshake to completion
    /// (or `not_connected` on timeout), then spawns the tick loop.
    pub async fn connect(
        socket: Arc<UdpSocket>,
        server_addr: SocketAddr,
        executor: &Arc<Executor>,
        connect_timeout: Duration,
    ) -> RpcResult<Arc<Self>> {
        let conv = random_conv();
        let session = Self::new(conv, server_addr, socket, SessionStatus::Handshaking);

        let (connected_tx, mut connected_rx) = oneshot::channel();
        *session.connected_tx.lock().expect("connected_tx mutex poisoned") = Some(connected_tx);

        session.spawn_tick_loop(executor);

        let hello = encode_hello(conv);
        let attempts = (connect_timeout.as_millis() / HELLO_RETRY_INTERVAL.as_millis()).max(1) as u32;
        for attempt in 0..attempts {
            if session.status() == SessionStatus::Connected {
                break;
            }
            if let Err(e) = session.socket.send_to(&hello, session.peer_addr).await {
                warn!(attempt, error = %e, "failed to send HELLO datagram");
            }
            tokio::select! {
                _ = &mut connected_rx => break,
                _ = tokio::time::sleep(HELLO_RETRY_INTERVAL) => {}
            }
        }

        if session.status() != SessionStatus::Connected {
            session.transition_closed();
            return Err(RpcError::NotConnected);
        }
        Ok(session)
    }

    /// Server-side constructor for a freshly-seen `HELLO`. Replies with
    /// `HELLO_ACK` and moves straight to `Connected` without waiting for
    /// further confirmation, per SPEC_FULL.md §4.4.
    pub async fn accept(
        socket: Arc<UdpSocket>,
        peer_addr: SocketAddr,
        conv: u32,
        executor: &Arc<Executor>,
    ) -> RpcResult<Arc<Self>> {
        let session = Self::new(conv, peer_addr, socket, SessionStatus::Connected);
        session
            .socket
            .send_to(&encode_hello(conv), peer_addr)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        session.spawn_tick_loop(executor);
        debug!(conv, peer = %peer_addr, "server session connected");
        Ok(session)
    }

    fn spawn_tick_loop(self: &Arc<Self>, executor: &Arc<Executor>) {
        let session = Arc::clone(self);
        let cancel = self.cancel.clone();
        executor.spawn_async(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(KCP_TICK_INTERVAL) => {}
                }
                let elapsed = session.started_at.elapsed().as_millis() as u32;
                {
                    let mut kcp = session.kcp.lock().expect("kcp mutex poisoned");
                    if kcp.update(elapsed).is_err() {
                        break;
                    }
                }
                session.flush_output().await;
            }
        });
    }

    async fn flush_output(&self) {
        loop {
            let packet = self.out_queue.lock().expect("kcp output queue poisoned").pop_front();
            let Some(packet) = packet else { break };
            if let Err(e) = self.socket.send_to(&packet, self.peer_addr).await {
                warn!(peer = %self.peer_addr, error = %e, "failed to send kcp datagram");
                break;
            }
        }
    }

    /// Called by the listening loop with a raw datagram already known to
    /// belong to this session (handshake framing and peer/conv matching
    /// happen in [`Demultiplexer`]).
    pub async fn deliver_datagram(self: &Arc<Self>, bytes: &[u8]) {
        if let Some(acked_conv) = decode_hello(bytes) {
            if acked_conv == self.conv && self.status() == SessionStatus::Handshaking {
                self.transition_connected();
            }
            return;
        }

        {
            let mut kcp = self.kcp.lock().expect("kcp mutex poisoned");
            if let Err(e) = kcp.input(bytes) {
                trace!(conv = self.conv, error = ?e, "kcp input rejected datagram");
                return;
            }
        }
        self.flush_output().await;
        self.drain_recv_queue();
    }

    fn drain_recv_queue(&self) {
        loop {
            let mut kcp = self.kcp.lock().expect("kcp mutex poisoned");
            let Ok(size) = kcp.peeksize() else { break };
            let mut buf = vec![0u8; size.max(1)];
            match kcp.recv(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    drop(kcp);
                    if self.recv_tx.send(Bytes::from(buf)).is_err() {
                        break;
                    }
                },
                Err(_) => break,
            }
        }
    }

    fn transition_connected(&self) {
        *self.status.lock().expect("status mutex poisoned") = SessionStatus::Connected;
        if let Some(tx) = self.connected_tx.lock().expect("connected_tx mutex poisoned").take() {
            let _ = tx.send(());
        }
        debug!(conv = self.conv, "session handshake complete");
    }

    fn transition_closed(&self) {
        let mut status = self.status.lock().expect("status mutex poisoned");
        if *status == SessionStatus::Closed {
            return;
        }
        *status = SessionStatus::Disconnecting;
        *status = SessionStatus::Closed;
    }

    /// Queues `bytes` for ordered, reliable delivery. Fails fast with
    /// `not_connected` if the handshake has not completed or the session is
    /// on its way down.
    pub fn send(&self, bytes: &[u8]) -> RpcResult<()> {
        if self.status() != SessionStatus::Connected {
            return Err(RpcError::NotConnected);
        }
        let mut kcp = self.kcp.lock().expect("kcp mutex poisoned");
        kcp.send(bytes)
            .map(|_| ())
            .map_err(|e| RpcError::Transport(format!("kcp send: {e:?}")))
    }

    /// Takes ownership of the inbound byte stream. May only be called once;
    /// a second call returns `None`.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.recv_rx.lock().expect("recv_rx mutex poisoned").take()
    }

    /// Transitions to `Disconnecting` then `Closed` and stops the tick loop.
    pub fn close(&self) {
        self.transition_closed();
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for KcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpSession")
            .field("conv", &self.conv)
            .field("peer_addr", &self.peer_addr)
            .field("status", &self.status())
            .finish()
    }
}

/// Owns a server's listening socket and routes inbound datagrams to the
/// session they belong to, keyed by peer address (one logical session per
/// peer, consistent with sessions not being multiplexed -- SPEC_FULL.md §1
/// Non-goals). A datagram whose leading bytes don't match any live
/// session's conv, and aren't a `HELLO`, is handed to `on_illegal`.
pub struct Demultiplexer {
    socket: Arc<UdpSocket>,
    sessions: DashMap<SocketAddr, Arc<KcpSession>>,
}

impl Demultiplexer {
    pub fn new(socket: Arc<UdpSocket>) -> Arc<Self> {
        Arc::new(Self { socket, sessions: DashMap::new() })
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn remove(&self, peer_addr: SocketAddr) {
        self.sessions.remove(&peer_addr);
    }

    /// Runs until the socket errors. `select_executor` is called once per
    /// newly accepted session to pick which pool executor drives its tick
    /// loop (SPEC_FULL.md §4.7's round-robin session assignment); `on_accept`
    /// is invoked with each newly established server-side session (after the
    /// `HELLO_ACK` has been sent) and the executor it was assigned, so the
    /// caller can bind its own session wrapper to the same executor;
    /// `on_illegal` is invoked with datagrams that match no session and
    /// aren't a valid `HELLO`.
    pub async fn run_acceptor(
        self: Arc<Self>,
        select_executor: impl Fn() -> Arc<Executor> + Send + Sync + 'static,
        on_accept: impl Fn(Arc<KcpSession>, Arc<Executor>) + Send + Sync + 'static,
        on_illegal: impl Fn(SocketAddr, &[u8]) + Send + Sync + 'static,
    ) {
        let mut buf = vec![0u8; RECV_SCRATCH_LEN];
        loop {
            let (n, peer_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "acceptor socket recv_from failed, stopping");
                    return;
                },
            };
            let datagram = &buf[..n];

            if let Some(conv) = decode_hello(datagram) {
                if !self.sessions.contains_key(&peer_addr) {
                    let executor = select_executor();
                    match KcpSession::accept(Arc::clone(&self.socket), peer_addr, conv, &executor).await {
                        Ok(session) => {
                            self.sessions.insert(peer_addr, Arc::clone(&session));
                            on_accept(session, executor);
                        },
                        Err(e) => warn!(peer = %peer_addr, error = ?e, "failed to accept session"),
                    }
                }
                continue;
            }

            let Some(session) = self.sessions.get(&peer_addr).map(|e| Arc::clone(e.value())) else {
                on_illegal(peer_addr, datagram);
                continue;
            };
            session.deliver_datagram(datagram).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let conv = random_conv();
        assert_ne!(conv, 0);
        let encoded = encode_hello(conv);
        assert_eq!(decode_hello(&encoded), Some(conv));
    }

    #[test]
    fn non_hello_bytes_are_not_mistaken_for_hello() {
        assert_eq!(decode_hello(b"not-a-hello-datagram"), None);
        assert_eq!(decode_hello(&[0u8; 8]), None);
    }

    #[tokio::test]
    async fn connect_fails_fast_when_nobody_answers() {
        let client_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind client"));
        let dead_addr: SocketAddr = "127.0.0.1:1".parse().expect("valid addr");
        let executor = Executor::new(0, crate::pool::PendingCounter::new());
        executor.start().expect("start executor");

        let result = KcpSession::connect(
            client_socket,
            dead_addr,
            &executor,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(result.err(), Some(RpcError::NotConnected));
    }
}
