// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Core machinery for an RPC framework running over a reliable-UDP (KCP)
//! transport: request/response correlation, a per-endpoint I/O pool,
//! length-prefixed framing and the session state machine.

pub mod cfg;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod rpc;
pub mod transport;

pub use error::{LastError, RpcError, RpcResult};
