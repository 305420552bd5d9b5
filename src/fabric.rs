// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The provider interface the transports are written against.
//!
//! A provider exposes the usual fabric object hierarchy: a [`Provider`]
//! resolves [`Info`] and opens a [`Fabric`]; the fabric opens event queues,
//! domains, and passive endpoints; a [`Domain`] opens endpoints, completion
//! queues, address vectors, and memory regions. The traits are object safe so
//! the transports can hold `Box<dyn _>` handles and stay independent of the
//! provider in use.

use std::any::Any;
use std::fmt;

use crate::Result;

/// Fabric providers the library recognizes. Selection happens at endpoint
/// construction and is carried through [`Hints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// RDMA-CM-IB-RC over verbs hardware.
    Verbs,
    /// TCP-backed sockets provider.
    Sockets,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProviderKind::Verbs => write!(f, "verbs"),
            ProviderKind::Sockets => write!(f, "sockets"),
        }
    }
}

/// Endpoint flavors used by the transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    /// Connection-oriented message endpoint.
    Msg,
    /// Reliable-datagram endpoint addressed through an address vector.
    Rdm,
}

/// Capability bits requested through hints and reported back in [`Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Caps(u32);

impl Caps {
    pub const MSG: Caps = Caps(1);
    pub const RMA: Caps = Caps(1 << 1);
    pub const TAGGED: Caps = Caps(1 << 2);
    pub const ATOMIC: Caps = Caps(1 << 3);
    pub const DIRECTED_RECV: Caps = Caps(1 << 4);

    pub fn contains(self, other: Caps) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Caps {
    type Output = Caps;
    fn bitor(self, rhs: Caps) -> Caps {
        Caps(self.0 | rhs.0)
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (Caps::MSG, "MSG"),
            (Caps::RMA, "RMA"),
            (Caps::TAGGED, "TAGGED"),
            (Caps::ATOMIC, "ATOMIC"),
            (Caps::DIRECTED_RECV, "DIRECTED_RECV"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Access rights attached to a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access(u32);

impl Access {
    pub const LOCAL_READ: Access = Access(1);
    pub const LOCAL_WRITE: Access = Access(1 << 1);
    pub const REMOTE_READ: Access = Access(1 << 2);
    pub const REMOTE_WRITE: Access = Access(1 << 3);

    /// All four rights; the usual registration default.
    pub fn all() -> Access {
        Access::LOCAL_READ | Access::LOCAL_WRITE | Access::REMOTE_READ | Access::REMOTE_WRITE
    }

    pub fn contains(self, other: Access) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;
    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

/// Memory-registration mode bits carried in hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MrMode(u32);

impl MrMode {
    pub const LOCAL: MrMode = MrMode(1);
    pub const ALLOCATED: MrMode = MrMode(1 << 1);
    pub const PROV_KEY: MrMode = MrMode(1 << 2);
    pub const VIRT_ADDR: MrMode = MrMode(1 << 3);

    pub fn contains(self, other: MrMode) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for MrMode {
    type Output = MrMode;
    fn bitor(self, rhs: MrMode) -> MrMode {
        MrMode(self.0 | rhs.0)
    }
}

/// Capability request handed to [`Provider::get_info`].
#[derive(Debug, Clone)]
pub struct Hints {
    pub caps: Caps,
    pub ep_type: EndpointType,
    pub provider: ProviderKind,
    pub mr_mode: MrMode,
}

impl Hints {
    /// Hints for a connection-oriented endpoint: message, RMA, and atomic
    /// capabilities with the full registration mode set.
    pub fn msg(provider: ProviderKind) -> Hints {
        Hints {
            caps: Caps::MSG | Caps::RMA | Caps::ATOMIC,
            ep_type: EndpointType::Msg,
            provider,
            mr_mode: MrMode::LOCAL | MrMode::ALLOCATED | MrMode::PROV_KEY | MrMode::VIRT_ADDR,
        }
    }

    /// Hints for a connectionless endpoint carrying tagged traffic.
    pub fn rdm(provider: ProviderKind, caps: Caps) -> Hints {
        Hints {
            caps,
            ep_type: EndpointType::Rdm,
            provider,
            mr_mode: MrMode::LOCAL | MrMode::ALLOCATED | MrMode::PROV_KEY | MrMode::VIRT_ADDR,
        }
    }
}

/// Opaque connection-request token carried inside [`Info`] from a
/// [`Event::ConnRequest`] to the endpoint that accepts it.
#[derive(Clone)]
pub struct ConnHandle {
    inner: std::sync::Arc<dyn Any + Send + Sync>,
}

impl ConnHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> ConnHandle {
        ConnHandle {
            inner: std::sync::Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

/// A resolved fabric description, the analog of the provider's info list
/// entry. Produced by [`Provider::get_info`] and by connect-request events.
pub struct Info {
    pub provider: ProviderKind,
    pub ep_type: EndpointType,
    pub caps: Caps,
    /// Human-readable provider/fabric identification, for logs.
    pub fabric_name: String,
    /// Provider-opaque source address, present when resolving for a
    /// listening endpoint.
    pub src_addr: Option<Vec<u8>>,
    /// Provider-opaque destination address, present when resolving for an
    /// active endpoint.
    pub dest_addr: Option<Vec<u8>>,
    /// Suggested transmit completion-queue depth.
    pub tx_size: usize,
    /// Suggested receive completion-queue depth.
    pub rx_size: usize,
    /// Connection-request token; only set on infos delivered by
    /// [`Event::ConnRequest`].
    pub handle: Option<ConnHandle>,
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Info")
            .field("provider", &self.provider)
            .field("ep_type", &self.ep_type)
            .field("caps", &format_args!("{}", self.caps))
            .field("fabric_name", &self.fabric_name)
            .field("src_addr", &self.src_addr)
            .field("dest_addr", &self.dest_addr)
            .field("tx_size", &self.tx_size)
            .field("rx_size", &self.rx_size)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

/// Event-queue depth request.
#[derive(Debug, Clone, Copy)]
pub struct EqAttr {
    pub size: usize,
}

/// Completion entry layouts a queue can be opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqFormat {
    Context,
    Msg,
    Tagged,
}

/// Completion-queue shape: depth and entry format, never a wait object.
#[derive(Debug, Clone, Copy)]
pub struct CqAttr {
    pub size: usize,
    pub format: CqFormat,
}

/// Address-vector sizing request.
#[derive(Debug, Clone, Copy)]
pub struct AvAttr {
    pub count: usize,
}

/// Connection lifecycle events delivered through an [`EventQueue`].
pub enum Event {
    /// A peer asked to connect; the payload describes the requested
    /// connection and carries the accept token.
    ConnRequest(Info),
    Connected,
    Shutdown,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::ConnRequest(_) => write!(f, "ConnRequest"),
            Event::Connected => write!(f, "Connected"),
            Event::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// An error entry drained from a completion queue.
#[derive(Debug, Clone)]
pub struct CqError {
    /// OS-style error code reported by the provider.
    pub errno: i32,
    /// Provider-specific description of the failed operation.
    pub detail: String,
}

/// Outcome of one non-blocking completion-queue read.
#[derive(Debug)]
pub enum CqPoll {
    /// One completion entry was drained.
    Completed,
    /// The queue was empty.
    WouldBlock,
    /// An error entry was drained.
    Failed(CqError),
}

/// Address-vector handle for a resolved peer.
pub type PeerAddr = u64;

/// Unspecified peer: matches any source on receives; invalid as a
/// destination.
pub const PEER_ANY: PeerAddr = u64::MAX;

/// Opaque local-access descriptor attached to a registered buffer and passed
/// back with each post that uses the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDesc(pub u64);

/// Entry point of a provider implementation.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve fabric info for `node`/`service` under `hints`. With `source`
    /// set, the resolution is for a local (listening or receiving) address;
    /// otherwise `node:service` names the destination.
    fn get_info(
        &self,
        node: Option<&str>,
        service: &str,
        source: bool,
        hints: &Hints,
    ) -> Result<Info>;

    fn open_fabric(&self, info: &Info) -> Result<Box<dyn Fabric>>;
}

pub trait Fabric: Send {
    fn open_event_queue(&self, attr: &EqAttr) -> Result<Box<dyn EventQueue>>;
    fn open_domain(&self, info: &Info) -> Result<Box<dyn Domain>>;
    fn open_passive_endpoint(&self, info: &Info) -> Result<Box<dyn PassiveEndpoint>>;
}

pub trait Domain: Send {
    fn open_endpoint(&self, info: &Info) -> Result<Box<dyn Endpoint>>;
    fn open_completion_queue(&self, attr: &CqAttr) -> Result<Box<dyn CompletionQueue>>;
    fn open_address_vector(&self, attr: &AvAttr) -> Result<Box<dyn AddressVector>>;

    /// Register `len` bytes at `addr` with the given access rights. A
    /// `requested_key` of zero lets the provider choose the key; the key on
    /// the returned region is authoritative either way.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and allocated until the returned region is
    /// dropped. While the region grants remote access, the provider may read
    /// or write the memory from other threads.
    unsafe fn mr_reg(
        &self,
        addr: *mut u8,
        len: usize,
        access: Access,
        requested_key: u64,
    ) -> Result<Box<dyn MemoryRegion>>;
}

pub trait PassiveEndpoint: Send {
    fn bind_event_queue(&mut self, eq: &dyn EventQueue) -> Result<()>;

    /// Start delivering [`Event::ConnRequest`] events to the bound queue.
    fn listen(&mut self) -> Result<()>;
}

/// An active endpoint. Data-plane posts are raw-pointer based: the caller
/// lends the memory to the provider until the matching completion is drained
/// from the bound queue.
pub trait Endpoint: Send {
    fn bind_event_queue(&mut self, eq: &dyn EventQueue) -> Result<()>;
    fn bind_completion_queues(
        &mut self,
        tx: &dyn CompletionQueue,
        rx: &dyn CompletionQueue,
    ) -> Result<()>;
    fn bind_address_vector(&mut self, av: &dyn AddressVector) -> Result<()>;
    fn enable(&mut self) -> Result<()>;

    /// Issue a connection request to the provider-opaque `dest` address. The
    /// outcome arrives on the bound event queue.
    fn connect(&mut self, dest: &[u8]) -> Result<()>;

    /// Accept the connection request this endpoint was opened from.
    fn accept(&mut self) -> Result<()>;

    /// The provider-opaque local address of this endpoint.
    fn name(&self) -> Result<Vec<u8>>;

    /// # Safety
    ///
    /// `buf[..len]` must stay valid and untouched until the matching transmit
    /// completion is drained.
    unsafe fn post_send(
        &self,
        buf: *const u8,
        len: usize,
        desc: Option<LocalDesc>,
        dest: PeerAddr,
    ) -> Result<()>;

    /// # Safety
    ///
    /// `buf[..len]` must stay valid, and must not be read or written by the
    /// caller, until the matching receive completion is drained.
    unsafe fn post_recv(
        &self,
        buf: *mut u8,
        len: usize,
        desc: Option<LocalDesc>,
        src: PeerAddr,
    ) -> Result<()>;

    /// One-sided read of `len` bytes from the peer region named by
    /// `(remote_addr, key)` into `buf`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Endpoint::post_recv`], against the transmit
    /// queue.
    unsafe fn post_read(
        &self,
        buf: *mut u8,
        len: usize,
        desc: Option<LocalDesc>,
        remote_addr: u64,
        key: u64,
    ) -> Result<()>;

    /// One-sided write of `len` bytes from `buf` into the peer region named
    /// by `(remote_addr, key)`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Endpoint::post_send`].
    unsafe fn post_write(
        &self,
        buf: *const u8,
        len: usize,
        desc: Option<LocalDesc>,
        remote_addr: u64,
        key: u64,
    ) -> Result<()>;

    /// # Safety
    ///
    /// Same requirements as [`Endpoint::post_send`].
    unsafe fn post_tagged_send(
        &self,
        buf: *const u8,
        len: usize,
        desc: Option<LocalDesc>,
        dest: PeerAddr,
        tag: u64,
    ) -> Result<()>;

    /// # Safety
    ///
    /// Same requirements as [`Endpoint::post_recv`].
    unsafe fn post_tagged_recv(
        &self,
        buf: *mut u8,
        len: usize,
        desc: Option<LocalDesc>,
        src: PeerAddr,
        tag: u64,
    ) -> Result<()>;
}

pub trait EventQueue: Send + Sync {
    /// Read the next event. With `blocking` set the call spins until an
    /// event is available; otherwise `Ok(None)` means the queue was empty.
    fn read(&self, blocking: bool) -> Result<Option<Event>>;

    fn as_any(&self) -> &dyn Any;
}

pub trait CompletionQueue: Send + Sync {
    /// Drain at most one entry.
    fn read(&self) -> CqPoll;

    fn as_any(&self) -> &dyn Any;
}

pub trait AddressVector: Send + Sync {
    /// Insert a provider-opaque peer address, returning its handle.
    fn insert(&self, addr: &[u8]) -> Result<PeerAddr>;

    fn remove(&self, peer: PeerAddr) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// A registered memory region. Dropping the handle closes the registration.
pub trait MemoryRegion: Send {
    /// The remote-access key, possibly rewritten by the provider.
    fn key(&self) -> u64;

    /// The local-access descriptor posts should carry for this region.
    fn descriptor(&self) -> LocalDesc;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_bits() {
        let rw = Access::REMOTE_READ | Access::REMOTE_WRITE;
        assert!(rw.contains(Access::REMOTE_READ));
        assert!(!rw.contains(Access::LOCAL_WRITE));
        assert!(Access::all().contains(rw));
    }

    #[test]
    fn caps_display() {
        let caps = Caps::MSG | Caps::TAGGED;
        assert_eq!(format!("{caps}"), "MSG|TAGGED");
        assert_eq!(format!("{}", Caps::default()), "none");
    }

    #[test]
    fn msg_hints_request_rma() {
        let hints = Hints::msg(ProviderKind::Sockets);
        assert!(hints.caps.contains(Caps::MSG | Caps::RMA | Caps::ATOMIC));
        assert!(hints.mr_mode.contains(MrMode::PROV_KEY | MrMode::VIRT_ADDR));
    }
}
