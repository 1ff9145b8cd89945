//! Server acceptor and client connector built on the transport and RPC
//! layers. See SPEC_FULL.md §4.7.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod client;
pub mod server;
pub mod session;

pub use client::Client;
pub use server::Server;
pub use session::Session;

/// Type-erased endpoint back-reference handed to handlers bound with
/// [`crate::rpc::Dispatcher::bind_with_endpoint`]. Kept as a trait object so
/// the leaf `rpc`/`session` modules don't need to name `Server`/`Client`
/// concretely.
pub trait EndpointHandle: Send + Sync + std::fmt::Debug {
    fn session_count(&self) -> usize;
}
