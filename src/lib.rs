// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A networking library over fabric-style transport primitives.
//!
//! The crate offers three transports built on the provider interface in
//! [`fabric`]: connection-oriented message and RMA channels ([`Connection`]),
//! a connectionless tagged datagram channel ([`ConnectionlessServer`] /
//! [`ConnectionlessClient`]), and an RPC layer ([`rpc`]) on top of the
//! connectionless engine. Broadcast helpers live in [`broadcast`].
//!
//! Providers are pluggable; the in-process [`loopback`] provider routes all
//! traffic through shared memory and is used by the test suite and the demo
//! binaries.

pub mod broadcast;
pub mod buffer;
pub mod connection;
pub mod connectionless;
pub mod fabric;
pub mod loopback;
pub mod rpc;
pub mod shmem;

pub(crate) mod completion;

pub use buffer::{FabricBuf, SharedBuf, UniqueBuf};
pub use connection::Connection;
pub use connectionless::{ConnectionlessClient, ConnectionlessServer};
pub use fabric::{Access, PeerAddr, ProviderKind, PEER_ANY};
pub use loopback::LoopbackProvider;

use std::fmt;

use thiserror::Error;

/// Default port used when none is given.
pub const DEFAULT_PORT: u16 = 8080;

/// Largest payload accepted by any single operation, in bytes. Requests
/// beyond this are rejected with [`Error::MessageTooLarge`].
pub const MAX_MSG_SIZE: usize = 4096;

/// Tag reserved for the connectionless address handshake.
pub const TAG_HANDSHAKE: u64 = 1;

/// Tag carrying application payloads on connectionless endpoints.
pub const TAG_MESSAGE: u64 = 2;

/// Tag carrying broadcast payloads.
pub const TAG_BROADCAST: u64 = 3;

/// The errors that can arise while setting up fabric objects or moving data
/// through them.
#[derive(Debug, Error)]
pub enum Error {
    /// The provider had no info matching the requested capabilities.
    #[error("no fabric info matched the requested capabilities: {0}")]
    CapabilityUnavailable(String),

    /// Creating or binding a fabric, domain, endpoint, or queue failed.
    #[error("fabric setup failed: {0}")]
    Setup(String),

    /// The event queue yielded something other than the expected connection
    /// event, or the event payload was truncated.
    #[error("connection rejected: {0}")]
    ConnectRejected(String),

    /// A post returned a "try again" condition. Callers of the `try_`
    /// variants observe this as a `false` return.
    #[error("transient failure posting {op}")]
    TransientPost { op: &'static str },

    /// An error entry was drained from a completion queue.
    #[error("completion error ({errno}): {detail}")]
    Completion { errno: i32, detail: String },

    /// A remote-access operation was attempted against a memory region that
    /// does not grant it.
    #[error("remote access denied: {0}")]
    PermissionDenied(String),

    /// The caller asked to move more than [`MAX_MSG_SIZE`] bytes.
    #[error("message of {size} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// The RPC server received a function id with no registered handler.
    #[error("no handler registered for function id {0}")]
    HandlerMissing(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for conditions where retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientPost { .. })
    }
}

/// Roles a connection-oriented endpoint can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues the connection request.
    Active,
    /// Listens for a connection request.
    Passive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Active => write!(f, "active"),
            Role::Passive => write!(f, "passive"),
        }
    }
}

/// Reads a little-endian u64 length field at `offset`. The handshake and RPC
/// wire formats both lead with one.
pub(crate) fn u64_at(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}
