// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use kcp_rpc::error::RpcError;
use serde::{Deserialize, Serialize};

use crate::integration_tests::common::{spawn_connected_client, spawn_server};

#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct User {
    name: String,
    age: u32,
    perms: BTreeMap<u16, String>,
}

fn lilei() -> User {
    let mut perms = BTreeMap::new();
    perms.insert(1, "read".to_string());
    perms.insert(2, "write".to_string());
    User { name: "lilei".to_string(), age: 32, perms }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_bound_procedures_answer_correctly() {
    let (server, addr) = spawn_server(1 << 20).await;
    server.bind("add", |(a, b): (i64, i64)| a + b);
    server.bind("mul", |(a, b): (f64, f64)| a * b);
    server.bind("get_user", |(): ()| lilei());
    server.bind_with_session("cat", |_session, (a, b): (String, String)| format!("{a}{b}"));
    server.bind_async("async_add", |(a, b): (i64, i64)| async move { a + b });

    let client = spawn_connected_client(addr, 1 << 20).await;

    let sum: i64 = client.async_call("add", (11, 12)).await.expect("add succeeds");
    assert_eq!(sum, 23);

    let arity_err: RpcError = client.async_call::<_, i64>("add", (11,)).await.expect_err("arity mismatch");
    assert!(matches!(arity_err, RpcError::InvalidArgument(_)));

    let not_found: RpcError =
        client.async_call::<_, i64>("no_exists_fn", (12, 13)).await.expect_err("unregistered name");
    assert!(matches!(not_found, RpcError::NotFound(_)));

    let cat: String = client.async_call("cat", ("abc".to_string(), "123".to_string())).await.expect("cat succeeds");
    assert_eq!(cat, "abc123");

    let product: f64 = client.async_call("mul", (6.5, 6.5)).await.expect("mul succeeds");
    assert_eq!(product, 42.25);

    let user: User = client.async_call("get_user", ()).await.expect("get_user succeeds");
    assert_eq!(user, lilei());

    let async_sum: i64 = client.async_call("async_add", (15, 18)).await.expect("async_add succeeds");
    assert_eq!(async_sum, 33);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trips_any_payload_under_the_configured_max() {
    let (server, addr) = spawn_server(1 << 20).await;
    server.bind("echo", |(payload,): (String,)| payload);

    let client = spawn_connected_client(addr, 1 << 20).await;
    let payload = "x".repeat(900);
    let echoed: String = client.async_call("echo", (payload.clone(),)).await.expect("echo succeeds");
    assert_eq!(echoed, payload);

    client.stop().await;
    server.stop().await;
}
