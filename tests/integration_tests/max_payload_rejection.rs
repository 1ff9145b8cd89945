// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use kcp_rpc::error::RpcError;

use crate::integration_tests::common::{spawn_connected_client, spawn_server};

/// A request whose framed size exceeds `max_message_size` is rejected
/// before it ever reaches the wire: `Session::frame` applies the same
/// length-prefix cap on the send path that the receiving peer's
/// `FrameCodec` enforces on the receive path, so an oversized payload
/// fails fast with `invalid_argument` instead of silently desyncing the
/// stream or depending on the peer to notice and tear the session down.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversize_payload_is_rejected_before_it_reaches_the_wire() {
    const MAX_MESSAGE_SIZE: u32 = 1024;
    let (server, addr) = spawn_server(MAX_MESSAGE_SIZE).await;
    server.bind("echo", |(payload,): (String,)| payload);

    let client = spawn_connected_client(addr, MAX_MESSAGE_SIZE).await;

    let oversized = "0".repeat(1500);
    let result: Result<String, RpcError> = client.async_call("echo", (oversized,)).await;
    assert!(matches!(result, Err(RpcError::InvalidArgument(_))));

    // the session survives a rejected oversized call -- it never touched
    // the wire, so there is nothing for the peer to desync on.
    let ok: String = client.async_call("echo", ("fits fine".to_string(),)).await.expect("small call still works");
    assert_eq!(ok, "fits fine");

    client.stop().await;
    server.stop().await;
}
