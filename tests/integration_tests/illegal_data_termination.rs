// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use kcp_rpc::pool::IoPool;
use kcp_rpc::transport::KcpSession;
use tokio::{net::UdpSocket, sync::oneshot, time::timeout};

use crate::integration_tests::common::spawn_server;

/// A peer that sends bytes that can never be resynchronized into valid
/// frames -- here, a length prefix larger than the configured
/// `max_message_size` -- gets its session torn down rather than leaving the
/// stream silently desynced. Bypasses `Client`/`Session` to drive the raw
/// KCP transport directly, since `Session::send` always frames correctly
/// and can't produce an illegal frame on its own.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn illegal_frame_terminates_the_session() {
    const MAX_MESSAGE_SIZE: u32 = 4096;
    let (server, addr) = spawn_server(MAX_MESSAGE_SIZE).await;

    let (disconnected_tx, disconnected_rx) = oneshot::channel();
    let disconnected_tx = std::sync::Mutex::new(Some(disconnected_tx));
    server.bind_disconnect(move |_session| {
        if let Some(tx) = disconnected_tx.lock().expect("mutex poisoned").take() {
            let _ = tx.send(());
        }
    });

    let pool = IoPool::new(1);
    pool.start().expect("pool starts");
    let executor = pool.get(Some(0));

    let client_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind client socket"));
    let server_addr: SocketAddr = addr;
    let session = KcpSession::connect(client_socket, server_addr, &executor, Duration::from_secs(1))
        .await
        .expect("raw handshake succeeds");

    // A length prefix claiming a frame far larger than `max_message_size`:
    // not a valid frame under any interpretation, and not resynchronizable.
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&(MAX_MESSAGE_SIZE * 4).to_be_bytes());
    garbage.extend_from_slice(b"does not matter, never reached");
    session.send(&garbage).expect("queues onto the reliable stream");

    timeout(Duration::from_secs(2), disconnected_rx)
        .await
        .expect("on_disconnect fires")
        .expect("sender not dropped");

    assert_eq!(server.get_session_count(), 0);

    session.close();
    pool.stop().await;
    server.stop().await;
}
