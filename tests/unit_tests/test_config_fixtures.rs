// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use kcp_rpc::cfg::config::{ClientConfig, ServerConfig};

#[test]
fn client_config_loads_and_validates_from_yaml() {
    let cfg = ClientConfig::load_from_file("tests/unit_tests/fixtures/client.yaml").expect("loads");
    assert_eq!(cfg.server_addr.port(), 19010);
    assert_eq!(cfg.endpoint.pool_size, 2);
    assert_eq!(cfg.endpoint.max_message_size, 65536);
    assert_eq!(cfg.endpoint.max_in_flight_calls, 256);
    assert_eq!(cfg.default_timeout, Duration::from_millis(4000));
    assert_eq!(cfg.connect_timeout, Duration::from_millis(1000));
    let auto_reconnect = cfg.auto_reconnect.expect("auto reconnect configured");
    assert!(auto_reconnect.enabled);
    assert_eq!(auto_reconnect.delay(), Duration::from_millis(500));
}

#[test]
fn server_config_loads_and_validates_from_yaml() {
    let cfg = ServerConfig::load_from_file("tests/unit_tests/fixtures/server.yaml").expect("loads");
    assert_eq!(cfg.bind_addr.port(), 19011);
    assert_eq!(cfg.endpoint.pool_size, 4);
    assert_eq!(cfg.endpoint.max_message_size, 131072);
    assert_eq!(cfg.max_sessions, 64);
}

#[test]
fn missing_fixture_file_is_a_load_error_not_a_panic() {
    assert!(ClientConfig::load_from_file("tests/unit_tests/fixtures/does_not_exist.yaml").is_err());
}
