// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The RPC layer over the connectionless engine.
//!
//! One request message carries everything the server needs to reply:
//!
//! ```text
//! offset  size          field
//! 0       8 bytes LE    client_addr_len  (= A)
//! 8       A bytes       client_addr (provider-opaque)
//! 8+A     8 bytes LE    fn_id
//! 16+A    8 bytes LE    arg_size  (= B)
//! 24+A    B bytes       arg_payload
//! ```
//!
//! The reply is `[reply_size: u64 LE][reply_bytes]`. Request and reply must
//! each fit in [`MAX_MSG_SIZE`](crate::MAX_MSG_SIZE) bytes.
//!
//! Function id [`SHUTDOWN_FN_ID`] is reserved: servers pre-register it to
//! set their shutdown flag and echo the argument back.

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::RpcServer;

use crate::{u64_at, Error, Result, MAX_MSG_SIZE};

/// Calling this function id shuts the server down after the reply is sent.
pub const SHUTDOWN_FN_ID: u64 = 0;

/// Opaque byte sequence used for arguments and results.
pub type Pack = Vec<u8>;

/// A registered RPC function: argument bytes in, result bytes out.
pub type RpcHandler = Box<dyn FnMut(&[u8]) -> Pack + Send>;

/// The server side of the RPC contract.
pub trait RpcService {
    /// Register `handler` under `fn_id`. Registrations must precede
    /// [`RpcService::start`]; a duplicate id is a programming error.
    fn register_rpc(&mut self, fn_id: u64, handler: RpcHandler);

    /// Serve requests until the shutdown function has been called.
    fn start(&mut self) -> Result<()>;
}

/// The client side of the RPC contract.
pub trait RpcCaller {
    fn call_remote(&mut self, fn_id: u64, arg: &[u8]) -> Result<Pack>;
}

/// Fixed-layout request header following the client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub fn_id: u64,
    pub arg_size: u64,
}

impl Header {
    pub const WIRE_SIZE: usize = 16;
}

pub(crate) fn encode_request(client_addr: &[u8], fn_id: u64, arg: &[u8]) -> Result<Vec<u8>> {
    let total = 8 + client_addr.len() + Header::WIRE_SIZE + arg.len();
    if total > MAX_MSG_SIZE {
        return Err(Error::MessageTooLarge {
            size: total,
            max: MAX_MSG_SIZE,
        });
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(client_addr.len() as u64).to_le_bytes());
    out.extend_from_slice(client_addr);
    out.extend_from_slice(&fn_id.to_le_bytes());
    out.extend_from_slice(&(arg.len() as u64).to_le_bytes());
    out.extend_from_slice(arg);
    Ok(out)
}

/// Split a received request into the client address, the header, and the
/// argument payload. Declared sizes that overrun the message bound are the
/// fatal too-large condition.
pub(crate) fn decode_request(buf: &[u8]) -> Result<(&[u8], Header, &[u8])> {
    let too_large = || Error::MessageTooLarge {
        size: buf.len(),
        max: MAX_MSG_SIZE,
    };

    let addr_len = u64_at(buf, 0).ok_or_else(too_large)? as usize;
    let header_at = 8 + addr_len;
    let fn_id = u64_at(buf, header_at).ok_or_else(too_large)?;
    let arg_size = u64_at(buf, header_at + 8).ok_or_else(too_large)? as usize;

    let arg_at = header_at + Header::WIRE_SIZE;
    if arg_at + arg_size > buf.len() {
        return Err(too_large());
    }

    Ok((
        &buf[8..8 + addr_len],
        Header {
            fn_id,
            arg_size: arg_size as u64,
        },
        &buf[arg_at..arg_at + arg_size],
    ))
}

pub(crate) fn encode_reply(payload: &[u8]) -> Result<Vec<u8>> {
    let total = 8 + payload.len();
    if total > MAX_MSG_SIZE {
        return Err(Error::MessageTooLarge {
            size: total,
            max: MAX_MSG_SIZE,
        });
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub(crate) fn decode_reply(buf: &[u8]) -> Result<Pack> {
    let reply_size = u64_at(buf, 0).ok_or(Error::MessageTooLarge {
        size: buf.len(),
        max: MAX_MSG_SIZE,
    })? as usize;

    let payload = buf.get(8..8 + reply_size).ok_or(Error::MessageTooLarge {
        size: 8 + reply_size,
        max: MAX_MSG_SIZE,
    })?;
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let addr = b"lo-client-7";
        let wire = encode_request(addr, 42, b"hello").unwrap();

        let (got_addr, header, arg) = decode_request(&wire).unwrap();
        assert_eq!(got_addr, addr);
        assert_eq!(
            header,
            Header {
                fn_id: 42,
                arg_size: 5
            }
        );
        assert_eq!(arg, b"hello");
    }

    #[test]
    fn request_layout_is_little_endian() {
        let wire = encode_request(b"ab", 0x0102, b"x").unwrap();
        assert_eq!(&wire[..8], &2u64.to_le_bytes());
        assert_eq!(&wire[8..10], b"ab");
        assert_eq!(&wire[10..18], &0x0102u64.to_le_bytes());
        assert_eq!(&wire[18..26], &1u64.to_le_bytes());
        assert_eq!(&wire[26..], b"x");
    }

    #[test]
    fn oversized_request_is_rejected() {
        let arg = vec![0u8; MAX_MSG_SIZE];
        match encode_request(b"a", 1, &arg) {
            Err(Error::MessageTooLarge { .. }) => {}
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn truncated_request_is_rejected() {
        let wire = encode_request(b"addr", 3, b"payload").unwrap();
        assert!(decode_request(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn reply_round_trip() {
        let wire = encode_reply(b"pong").unwrap();
        assert_eq!(&wire[..8], &4u64.to_le_bytes());
        assert_eq!(decode_reply(&wire).unwrap(), b"pong");
    }

    #[test]
    fn empty_reply_round_trip() {
        let wire = encode_reply(b"").unwrap();
        assert_eq!(decode_reply(&wire).unwrap(), Vec::<u8>::new());
    }
}
