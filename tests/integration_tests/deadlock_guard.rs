// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use kcp_rpc::{cfg::config::ClientConfig, endpoint::Client, error::RpcError};
use tokio::time::{timeout, Duration};

use crate::integration_tests::common::{client_config, spawn_server};

/// A synchronous `call()` issued from inside `on_connect` -- which fires on
/// the session's own executor -- must fail fast with `in_progress` instead
/// of blocking that executor forever waiting for a reply it can never
/// deliver to itself.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_call_from_on_connect_returns_in_progress_without_blocking() {
    let (server, addr) = spawn_server(1 << 20).await;
    server.bind("mul", |(a, b): (f64, f64)| a * b);

    let cfg: ClientConfig = client_config(addr, 1 << 20);
    let client = Arc::new(Client::new(cfg).expect("client config validates"));

    let observed_in_progress = Arc::new(AtomicBool::new(false));
    let observed_in_progress_cb = Arc::clone(&observed_in_progress);
    let client_for_cb = Arc::clone(&client);
    client.bind_connect(move |_session| {
        let result: Result<f64, RpcError> = client_for_cb.call("mul", (16.5, 26.5));
        observed_in_progress_cb.store(result == Err(RpcError::InProgress), Ordering::SeqCst);
    });

    timeout(Duration::from_secs(2), client.async_connect())
        .await
        .expect("connect does not hang")
        .expect("connect succeeds");

    assert!(observed_in_progress.load(Ordering::SeqCst), "on_connect's sync call should fail with in_progress");

    client.stop().await;
    server.stop().await;
}
