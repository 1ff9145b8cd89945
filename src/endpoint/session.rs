// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-peer protocol context: a KCP transport, its frame codec, and a
//! call correlator, bound to one executor. See SPEC_FULL.md §3 ("Session").

use std::{
    any::Any,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::{
    endpoint::EndpointHandle,
    error::{LastError, RpcError, RpcResult},
    pool::executor::Executor,
    rpc::{CallCorrelator, Dispatcher, HandlerContext},
    transport::{frame_codec::IllegalResponseHandler, Direction, Envelope, FrameCodec, KcpSession, SessionStatus},
};

/// Procedures are registered once against this concrete instantiation: the
/// session back-reference handlers receive is `Arc<Session>`; the endpoint
/// back-reference is type-erased behind [`EndpointHandle`] so this module
/// does not need to know about `Server`/`Client` concretely.
pub type ProcedureDispatcher = Dispatcher<Arc<Session>, Arc<dyn EndpointHandle>>;

pub struct Session {
    id: u64,
    kcp: Arc<KcpSession>,
    correlator: Arc<CallCorrelator>,
    executor: Arc<Executor>,
    default_timeout: Duration,
    max_message_size: u32,
    user_data: StdMutex<Option<Box<dyn Any + Send + Sync>>>,
    connect_fired: AtomicBool,
    disconnect_fired: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.kcp.peer_addr())
            .field("status", &self.kcp.status())
            .finish()
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl Session {
    pub(crate) fn new(
        kcp: Arc<KcpSession>,
        executor: Arc<Executor>,
        max_in_flight_calls: usize,
        default_timeout: Duration,
        max_message_size: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            correlator: CallCorrelator::new(Arc::clone(&executor), max_in_flight_calls),
            kcp,
            executor,
            default_timeout,
            max_message_size,
            user_data: StdMutex::new(None),
            connect_fired: AtomicBool::new(false),
            disconnect_fired: AtomicBool::new(false),
        })
    }

    /// Frames `envelope` for the wire: encodes it, then applies the
    /// length-prefix the receiving peer's `FrameCodec` expects to parse back
    /// out of the reliable byte stream (SPEC_FULL.md §4.3).
    fn frame(&self, envelope: &Envelope) -> RpcResult<Bytes> {
        FrameCodec::new(self.max_message_size).encode(&envelope.encode())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.kcp.peer_addr()
    }

    pub fn status(&self) -> SessionStatus {
        self.kcp.status()
    }

    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        *self.user_data.lock().expect("user_data mutex poisoned") = Some(Box::new(value));
    }

    pub fn get_user_data<T: Any + Clone + Send + Sync>(&self) -> Option<T> {
        self.user_data
            .lock()
            .expect("user_data mutex poisoned")
            .as_ref()
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// `true` the first time it is called for this session; used by the
    /// endpoint to enforce "on_connect fires at most once" (SPEC_FULL.md §8).
    pub(crate) fn mark_connected(&self) -> bool {
        self.connect_fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub(crate) fn mark_disconnected(&self) -> bool {
        self.disconnect_fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub(crate) fn correlator(&self) -> &Arc<CallCorrelator> {
        &self.correlator
    }

    pub(crate) fn kcp(&self) -> &Arc<KcpSession> {
        &self.kcp
    }

    /// Encodes `args`, registers the call, frames and sends the request,
    /// and awaits the decoded reply. Fails fast with `not_connected` before
    /// the handshake completes (SPEC_FULL.md §4.7's resolved Open Question).
    pub async fn async_call<Args, T>(
        self: &Arc<Self>,
        name: impl Into<String>,
        args: Args,
        timeout: Option<Duration>,
    ) -> RpcResult<T>
    where
        Args: Serialize,
        T: DeserializeOwned,
    {
        let session = Arc::clone(self);
        let name = name.into();
        LastError::scope_async(async move {
            if session.kcp.status() != SessionStatus::Connected {
                return Err(RpcError::NotConnected);
            }
            let payload = serde_json::to_vec(&args).map_err(|e| RpcError::InvalidArgument(e.to_string()))?;
            let (call_id, receiver) =
                session.correlator.begin_call(timeout.unwrap_or(session.default_timeout))?;
            let request = Envelope::request(call_id, name, Bytes::from(payload));
            let framed = match session.frame(&request) {
                Ok(framed) => framed,
                Err(e) => {
                    session.correlator.cancel(call_id);
                    return Err(e);
                },
            };
            if let Err(e) = session.kcp.send(&framed) {
                session.correlator.cancel(call_id);
                return Err(e);
            }
            let reply = receiver.await.map_err(|_| RpcError::OperationAborted)??;
            serde_json::from_slice(&reply.payload).map_err(|e| RpcError::InvalidArgument(e.to_string()))
        })
        .await
    }

    /// Synchronous variant of [`Session::async_call`]. Returns `in_progress`
    /// immediately -- without blocking -- when called from this session's
    /// own executor, where blocking would deadlock the very thread that
    /// would deliver the reply (SPEC_FULL.md §8 scenario S6).
    pub fn call<Args, T>(self: &Arc<Self>, name: impl Into<String>, args: Args) -> RpcResult<T>
    where
        Args: Serialize,
        T: DeserializeOwned,
    {
        LastError::scope(|| {
            if self.executor.is_current() {
                return Err(RpcError::InProgress);
            }
            let this = Arc::clone(self);
            let name = name.into();
            tokio::task::block_in_place(move || {
                tokio::runtime::Handle::current().block_on(this.async_call::<Args, T>(name, args, None))
            })
        })
    }

    /// Sends a fire-and-forget notification; no reply is expected.
    pub fn notify(&self, name: impl Into<String>, args: impl Serialize) -> RpcResult<()> {
        LastError::scope(|| {
            let payload = serde_json::to_vec(&args).map_err(|e| RpcError::InvalidArgument(e.to_string()))?;
            let envelope = Envelope::notify(name, Bytes::from(payload));
            let framed = self.frame(&envelope)?;
            self.kcp.send(&framed)
        })
    }

    /// Aborts outstanding calls and tears down the transport. Idempotent.
    pub(crate) fn shut_down(&self) {
        self.correlator.on_session_lost();
        self.kcp.close();
    }
}

async fn handle_envelope(
    session: &Arc<Session>,
    dispatcher: &ProcedureDispatcher,
    endpoint: &Arc<dyn EndpointHandle>,
    envelope: Envelope,
) {
    match envelope.direction {
        Direction::Reply => session.correlator.on_reply(envelope.call_id, envelope),
        Direction::Request | Direction::Notify => {
            let ctx = HandlerContext::new(Some(Arc::clone(session)), Some(Arc::clone(endpoint)));
            if let Some(reply) = dispatcher.dispatch(&envelope, ctx).await {
                match session.frame(&reply) {
                    Ok(framed) => {
                        if let Err(e) = session.kcp.send(&framed) {
                            warn!(session = session.id, error = ?e, "failed to send reply");
                        }
                    },
                    Err(e) => warn!(session = session.id, error = ?e, "reply too large to frame"),
                }
            }
        },
    }
}

/// Drains `session`'s inbound byte stream, reframes it, decodes each
/// envelope and routes it to the dispatcher or the correlator. Runs until
/// the stream ends (session closed) or a frame fails structural validation,
/// then tears the session down and fires `on_disconnect` at most once.
pub(crate) async fn run_read_loop(
    session: Arc<Session>,
    dispatcher: Arc<ProcedureDispatcher>,
    endpoint: Arc<dyn EndpointHandle>,
    max_message_size: u32,
    illegal_response_handler: Option<IllegalResponseHandler>,
    on_disconnect: impl Fn(Arc<Session>) + Send + 'static,
) {
    let Some(mut receiver) = session.kcp.take_receiver() else {
        warn!(session = session.id, "read loop started twice; receiver already taken");
        return;
    };

    let mut codec = FrameCodec::new(max_message_size);
    if let Some(handler) = illegal_response_handler {
        codec = codec.with_illegal_response_handler(handler);
    }

    while let Some(bytes) = receiver.recv().await {
        match codec.feed(&bytes) {
            Ok(frames) => {
                for frame in frames {
                    match Envelope::decode(frame) {
                        Ok(envelope) => handle_envelope(&session, &dispatcher, &endpoint, envelope).await,
                        Err(e) => warn!(session = session.id, error = ?e, "dropping undecodable envelope"),
                    }
                }
            },
            Err(_) => break,
        }
    }

    session.shut_down();
    if session.mark_disconnected() {
        on_disconnect(session);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::{pool::PendingCounter, transport::random_conv};

    fn test_executor() -> Arc<Executor> {
        let executor = Executor::new(0, PendingCounter::new());
        executor.start().expect("start executor");
        executor
    }

    async fn accepted_kcp_session(executor: &Arc<Executor>) -> Arc<KcpSession> {
        let server_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind server"));
        let peer: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        KcpSession::accept(server_socket, peer, random_conv(), executor).await.expect("accept")
    }

    #[tokio::test]
    async fn new_session_has_unique_monotonic_id() {
        let executor = test_executor();
        let kcp = accepted_kcp_session(&executor).await;
        let a = Session::new(Arc::clone(&kcp), Arc::clone(&executor), 8, Duration::from_secs(1), 4096);
        let b = Session::new(kcp, executor, 8, Duration::from_secs(1), 4096);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn mark_connected_fires_exactly_once() {
        let executor = test_executor();
        let kcp = accepted_kcp_session(&executor).await;
        let session = Session::new(kcp, executor, 8, Duration::from_secs(1), 4096);
        assert!(session.mark_connected());
        assert!(!session.mark_connected());
    }

    #[tokio::test]
    async fn async_call_before_connected_fails_fast() {
        let executor = test_executor();
        let server_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
        let peer: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        let kcp = KcpSession::accept(server_socket, peer, random_conv(), &executor).await.expect("accept");
        kcp.close();
        let session = Session::new(kcp, executor, 8, Duration::from_secs(1), 4096);
        let result: RpcResult<i64> = session.async_call("add", (1, 2), None).await;
        assert_eq!(result.err(), Some(RpcError::NotConnected));
    }

    #[tokio::test]
    async fn frame_applies_a_length_prefix_a_peer_codec_can_parse_back() {
        let executor = test_executor();
        let kcp = accepted_kcp_session(&executor).await;
        let session = Session::new(kcp, executor, 8, Duration::from_secs(1), 4096);
        let envelope = Envelope::notify("ping", Bytes::from_static(b"payload"));
        let framed = session.frame(&envelope).expect("frame");

        let mut reader = FrameCodec::new(4096);
        let frames = reader.feed(&framed).expect("feed");
        assert_eq!(frames.len(), 1);
        let decoded = Envelope::decode(frames[0].clone()).expect("decode");
        assert_eq!(decoded.name, "ping");
        assert_eq!(decoded.payload.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn frame_rejects_payload_over_configured_max() {
        let executor = test_executor();
        let kcp = accepted_kcp_session(&executor).await;
        let session = Session::new(kcp, executor, 8, Duration::from_secs(1), 8);
        let envelope = Envelope::notify("ping", Bytes::from_static(b"way too large for the cap"));
        assert!(session.frame(&envelope).is_err());
    }
}
