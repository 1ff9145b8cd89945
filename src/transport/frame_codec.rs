// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed message framing over the reliable byte stream a
//! [`crate::transport::kcp_session::KcpSession`] exposes. See SPEC_FULL.md
//! §4.3.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{RpcError, RpcResult};

pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
const LEN_PREFIX: usize = 4;

pub type IllegalResponseHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Prepends a 4-byte big-endian length prefix to `payload` and feeds
/// incoming bytes back into complete frames, buffering partial frames
/// between calls.
pub struct FrameCodec {
    max_message_size: u32,
    buf: BytesMut,
    illegal_response_handler: Option<IllegalResponseHandler>,
}

impl FrameCodec {
    pub fn new(max_message_size: u32) -> Self {
        Self {
            max_message_size,
            buf: BytesMut::new(),
            illegal_response_handler: None,
        }
    }

    pub fn with_illegal_response_handler(mut self, handler: IllegalResponseHandler) -> Self {
        self.illegal_response_handler = Some(handler);
        self
    }

    pub fn encode(&self, payload: &[u8]) -> RpcResult<Bytes> {
        if payload.len() as u64 > self.max_message_size as u64 {
            return Err(RpcError::InvalidArgument(format!(
                "payload of {} bytes exceeds max_message_size {}",
                payload.len(),
                self.max_message_size
            )));
        }
        let mut out = BytesMut::with_capacity(LEN_PREFIX + payload.len());
        out.put_u32(payload.len() as u32);
        out.put_slice(payload);
        Ok(out.freeze())
    }

    /// Appends `bytes` to the internal buffer and returns every frame that
    /// is now fully buffered, in order. On the first illegal frame the
    /// configured hook (if any) fires, the internal buffer is dropped, and
    /// `Err` is returned -- the caller is expected to close the session
    /// rather than keep feeding it, since the stream can no longer be
    /// reliably resynchronized.
    pub fn feed(&mut self, bytes: &[u8]) -> RpcResult<Vec<Bytes>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < LEN_PREFIX {
                break;
            }
            let len = u32::from_be_bytes(
                self.buf[..LEN_PREFIX]
                    .try_into()
                    .expect("slice is exactly LEN_PREFIX bytes"),
            );
            if len == 0 || len > self.max_message_size {
                let offending = self.buf.split().freeze();
                if let Some(handler) = &self.illegal_response_handler {
                    handler(&offending);
                } else {
                    warn!(len, max = self.max_message_size, "illegal frame length, no handler bound");
                }
                return Err(RpcError::IllegalData(format!(
                    "frame length {len} invalid (max {})",
                    self.max_message_size
                )));
            }

            let total = LEN_PREFIX + len as usize;
            if self.buf.len() < total {
                break;
            }
            let mut frame = self.buf.split_to(total);
            frame.advance(LEN_PREFIX);
            frames.push(frame.freeze());
        }

        Ok(frames)
    }
}
