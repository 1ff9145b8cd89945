// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use kcp_rpc::{cfg::config::ClientConfig, endpoint::Client};
use tokio::time::timeout;

use crate::integration_tests::common::{client_config, spawn_server, spawn_server_at};

/// With auto-reconnect enabled and a session forced closed, the client
/// reconnects on its own without the caller driving another `connect()`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_reconnects_after_forced_disconnect() {
    let (server, addr) = spawn_server(1 << 20).await;

    let mut cfg: ClientConfig = client_config(addr, 1 << 20);
    cfg.connect_timeout = Duration::from_millis(100);
    let client = Arc::new(Client::new(cfg).expect("client config validates"));
    client.auto_reconnect(true, Duration::from_millis(100));

    let connect_count = Arc::new(AtomicUsize::new(0));
    let connect_count_cb = Arc::clone(&connect_count);
    client.bind_connect(move |_session| {
        connect_count_cb.fetch_add(1, Ordering::SeqCst);
    });

    client.async_connect().await.expect("first connect succeeds");
    assert_eq!(connect_count.load(Ordering::SeqCst), 1);

    server.stop().await;
    // Give the forced disconnect's `on_disconnect` -> `schedule_reconnect`
    // chain a moment to fire before the server comes back up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Rebind to the exact same address the client is already configured
    // for, rather than a fresh ephemeral port the client has no way to
    // discover -- `ClientConfig::server_addr` is fixed at construction.
    let server = spawn_server_at(addr, 1 << 20).await;

    timeout(Duration::from_secs(3), async {
        while connect_count.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client reconnects once the server is back");

    client.auto_reconnect(false, Duration::from_millis(100));
    client.stop().await;
    server.stop().await;
}
