// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use kcp_rpc::{
    cfg::config::{ClientConfig, EndpointConfig, ServerConfig},
    endpoint::{Client, Server},
};

pub fn server_config(max_message_size: u32) -> ServerConfig {
    ServerConfig {
        endpoint: EndpointConfig {
            pool_size: 2,
            max_message_size,
            ..EndpointConfig::default()
        },
        bind_addr: "127.0.0.1:0".parse().expect("loopback addr"),
        max_sessions: 0,
    }
}

/// Starts a server on an ephemeral loopback port and returns it alongside
/// the address the OS actually bound.
pub async fn spawn_server(max_message_size: u32) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(server_config(max_message_size)).expect("server config validates"));
    server.async_start().await.expect("server starts");
    let addr = server.local_addr().expect("bound address available once started");
    (server, addr)
}

/// Starts a server bound to a specific address, e.g. to rebind a previously
/// used ephemeral port for a reconnect test. UDP sockets, unlike TCP, have no
/// lingering TIME_WAIT state blocking an immediate rebind.
pub async fn spawn_server_at(bind_addr: SocketAddr, max_message_size: u32) -> Arc<Server> {
    let config = ServerConfig {
        endpoint: EndpointConfig {
            pool_size: 2,
            max_message_size,
            ..EndpointConfig::default()
        },
        bind_addr,
        max_sessions: 0,
    };
    let server = Arc::new(Server::new(config).expect("server config validates"));
    server.async_start().await.expect("server rebinds");
    server
}

pub fn client_config(server_addr: SocketAddr, max_message_size: u32) -> ClientConfig {
    ClientConfig {
        endpoint: EndpointConfig {
            pool_size: 1,
            max_message_size,
            ..EndpointConfig::default()
        },
        server_addr,
        default_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_millis(500),
        auto_reconnect: None,
        reuse_address: false,
    }
}

pub async fn spawn_connected_client(server_addr: SocketAddr, max_message_size: u32) -> Arc<Client> {
    let client = Arc::new(Client::new(client_config(server_addr, max_message_size)).expect("client config validates"));
    client.async_connect().await.expect("client connects");
    client
}
