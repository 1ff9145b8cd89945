// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The envelope carried inside each framed message. See SPEC_FULL.md §6,
//! "Concrete envelope layout".

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RpcError, RpcResult};

const HEADER_LEN: usize = 1 + 8 + 2 + 2 + 4;

/// Reply `err_code` values the dispatcher assigns to its own failure
/// outcomes, distinct from an application handler's own error codes (any
/// other nonzero value). See SPEC_FULL.md §7.
pub mod reply_error {
    pub const NOT_FOUND: u16 = 1;
    pub const INVALID_ARGUMENT: u16 = 2;
    pub const INTERNAL: u16 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request = 0,
    Reply = 1,
    Notify = 2,
}

impl Direction {
    fn from_u8(b: u8) -> RpcResult<Self> {
        match b {
            0 => Ok(Direction::Request),
            1 => Ok(Direction::Reply),
            2 => Ok(Direction::Notify),
            other => Err(RpcError::IllegalData(format!("unknown direction byte {other}"))),
        }
    }
}

/// One RPC message: a request, a reply, or a fire-and-forget notification.
/// `call_id` is `0` and `name` is empty on the fields the direction does not
/// use, rather than varying the wire layout per direction -- a fixed layout
/// keeps `decode` branch-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub direction: Direction,
    pub call_id: u64,
    pub name: String,
    pub err_code: u16,
    pub payload: Bytes,
}

impl Envelope {
    pub fn request(call_id: u64, name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            direction: Direction::Request,
            call_id,
            name: name.into(),
            err_code: 0,
            payload,
        }
    }

    pub fn reply_ok(call_id: u64, payload: Bytes) -> Self {
        Self {
            direction: Direction::Reply,
            call_id,
            name: String::new(),
            err_code: 0,
            payload,
        }
    }

    pub fn reply_err(call_id: u64, err_code: u16, message: Bytes) -> Self {
        Self {
            direction: Direction::Reply,
            call_id,
            name: String::new(),
            err_code,
            payload: message,
        }
    }

    pub fn notify(name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            direction: Direction::Notify,
            call_id: 0,
            name: name.into(),
            err_code: 0,
            payload,
        }
    }

    pub fn is_ok_reply(&self) -> bool {
        self.direction == Direction::Reply && self.err_code == 0
    }

    pub fn encode(&self) -> Bytes {
        let name_bytes = self.name.as_bytes();
        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + name_bytes.len() + self.payload.len());
        buf.put_u8(self.direction as u8);
        buf.put_u64(self.call_id);
        buf.put_u16(name_bytes.len() as u16);
        buf.put_slice(name_bytes);
        buf.put_u16(self.err_code);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> RpcResult<Self> {
        if bytes.remaining() < 1 + 8 + 2 {
            return Err(RpcError::IllegalData("envelope shorter than fixed header".into()));
        }
        let direction = Direction::from_u8(bytes.get_u8())?;
        let call_id = bytes.get_u64();
        let name_len = bytes.get_u16() as usize;

        if bytes.remaining() < name_len + 2 + 4 {
            return Err(RpcError::IllegalData("envelope truncated before payload length".into()));
        }
        let name = String::from_utf8(bytes.split_to(name_len).to_vec())
            .map_err(|e| RpcError::IllegalData(format!("procedure name not UTF-8: {e}")))?;
        let err_code = bytes.get_u16();
        let payload_len = bytes.get_u32() as usize;

        if bytes.remaining() != payload_len {
            return Err(RpcError::IllegalData(format!(
                "declared payload length {payload_len} does not match remaining {}",
                bytes.remaining()
            )));
        }

        Ok(Self {
            direction,
            call_id,
            name,
            err_code,
            payload: bytes,
        })
    }
}
