//! Reliable-UDP transport: the KCP session state machine, its inbound
//! datagram demultiplexer, length-prefixed framing, and the RPC wire
//! envelope. See SPEC_FULL.md §4.3–§4.4.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod frame_codec;
pub mod kcp_session;
pub mod wire;

pub use frame_codec::{FrameCodec, IllegalResponseHandler, DEFAULT_MAX_MESSAGE_SIZE};
pub use kcp_session::{random_conv, Demultiplexer, KcpSession, SessionStatus};
pub use wire::{reply_error, Direction, Envelope};
