// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use kcp_rpc::{cfg::config::ClientConfig, endpoint::Client};
use tokio::time::{timeout, Duration};

use crate::integration_tests::common::{client_config, spawn_server};

/// Neither `bind_connect` nor a session-bound handler can issue a nested
/// call inline -- both run synchronously on the session's own executor, and
/// `Session::call` from that executor fails fast with `in_progress`
/// (SPEC_FULL.md §8 S6). The idiom is to spawn a background task that owns
/// the nested `async_call` instead. This drives three such nested calls --
/// one from the server's `on_connect`, two from a session-bound handler --
/// back into a procedure the client has bound, a single-client
/// simplification of the "3*N nested calls across N clients" scenario.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handlers_issue_nested_calls_via_spawned_tasks() {
    let (server, addr) = spawn_server(1 << 20).await;
    let nested_count = Arc::new(AtomicUsize::new(0));

    let connect_count_cb = Arc::clone(&nested_count);
    server.bind_connect(move |session| {
        let nested_count = Arc::clone(&connect_count_cb);
        tokio::spawn(async move {
            let _: i64 = session.async_call("sub", (10, 3), None).await.expect("nested call from on_connect");
            nested_count.fetch_add(1, Ordering::SeqCst);
        });
    });

    let cat_count_cb = Arc::clone(&nested_count);
    server.bind_with_session("cat", move |session, (a, b): (String, String)| {
        let nested_count = Arc::clone(&cat_count_cb);
        tokio::spawn(async move {
            let _: i64 = session.async_call("sub", (20, 4), None).await.expect("first nested call from cat");
            nested_count.fetch_add(1, Ordering::SeqCst);
            let _: i64 = session.async_call("sub", (30, 5), None).await.expect("second nested call from cat");
            nested_count.fetch_add(1, Ordering::SeqCst);
        });
        format!("{a}{b}")
    });

    let cfg: ClientConfig = client_config(addr, 1 << 20);
    let client = Arc::new(Client::new(cfg).expect("client config validates"));
    client.bind("sub", |(a, b): (i64, i64)| a - b);
    client.async_connect().await.expect("client connects");

    let cat: String = client.async_call("cat", ("hello".to_string(), "world".to_string())).await.expect("cat succeeds");
    assert_eq!(cat, "helloworld");

    timeout(Duration::from_secs(2), async {
        while nested_count.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("all three nested calls complete");

    client.stop().await;
    server.stop().await;
}
