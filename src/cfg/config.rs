// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Default timeout applied to a call when none is given explicitly.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);
/// Default ceiling on a single framed message (length-prefix + envelope).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1 << 20;
/// Default ceiling on outstanding calls tracked per session.
pub const DEFAULT_MAX_IN_FLIGHT_CALLS: usize = 4096;

/// Runtime configuration shared by client and server endpoints.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EndpointConfig {
    /// Number of I/O pool executors. `0` is coerced to `2 * hardware
    /// concurrency` at pool construction time.
    #[serde(rename = "PoolSize", default)]
    pub pool_size: usize,

    /// Ceiling on a single framed message, length-prefix included.
    #[serde(rename = "MaxMessageSize", default = "default_max_message_size")]
    pub max_message_size: u32,

    /// Ceiling on outstanding calls tracked per session.
    #[serde(rename = "MaxInFlightCalls", default = "default_max_in_flight")]
    pub max_in_flight_calls: usize,
}

fn default_max_message_size() -> u32 {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT_CALLS
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_in_flight_calls: DEFAULT_MAX_IN_FLIGHT_CALLS,
        }
    }
}

impl EndpointConfig {
    /// Validates invariants. Mirrors the teacher's
    /// `Config::validate_and_normalize` pattern: fail loudly rather than
    /// silently clamping to a usable-but-surprising value.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_message_size > 0, "MaxMessageSize must be > 0");
        ensure!(
            self.max_in_flight_calls > 0,
            "MaxInFlightCalls must be > 0"
        );
        Ok(())
    }
}

/// Client-only connection options (§4.7, §6).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,

    /// Address of the server this client connects (and reconnects) to.
    #[serde(rename = "ServerAddress")]
    pub server_addr: SocketAddr,

    /// Default per-call timeout unless overridden on `async_call(...)`.
    #[serde(rename = "DefaultTimeout", with = "serde_millis")]
    pub default_timeout: Duration,

    /// Deadline for the handshake to complete before `connect()` fails.
    #[serde(rename = "ConnectTimeout", with = "serde_millis")]
    pub connect_timeout: Duration,

    /// `(enabled, delay)`. When enabled, a lost session schedules a
    /// reconnect attempt after `delay`.
    #[serde(rename = "AutoReconnect", default)]
    pub auto_reconnect: Option<AutoReconnect>,

    /// Whether the client's UDP socket sets `SO_REUSEADDR`.
    #[serde(rename = "ReuseAddress", default)]
    pub reuse_address: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoReconnect {
    #[serde(rename = "Enabled")]
    pub enabled: bool,
    #[serde(rename = "DelayMillis")]
    pub delay_millis: u64,
}

impl AutoReconnect {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            default_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: Duration::from_secs(3),
            auto_reconnect: None,
            reuse_address: false,
        }
    }
}

impl ClientConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Self =
            serde_yaml::from_str(&s).context("failed to parse client config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()?;
        ensure!(
            !self.default_timeout.is_zero(),
            "DefaultTimeout must be > 0"
        );
        ensure!(
            !self.connect_timeout.is_zero(),
            "ConnectTimeout must be > 0"
        );
        Ok(())
    }
}

/// Server-only bind options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,

    /// Address the acceptor binds its UDP socket to.
    #[serde(rename = "BindAddress")]
    pub bind_addr: SocketAddr,

    /// Upper bound on concurrently tracked sessions; `0` means unbounded.
    #[serde(rename = "MaxSessions", default)]
    pub max_sessions: u32,
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Self =
            serde_yaml::from_str(&s).context("failed to parse server config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()
    }
}

/// Serde helpers for representing `Duration` as milliseconds, matching the
/// teacher's `serde_secs` helper but at millisecond granularity (connect and
/// reconnect timers in this crate are commonly sub-second).
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
