// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The connectionless engine: reliable-datagram endpoints addressed through
//! an address vector, with tag-matched sends and receives.
//!
//! Peers meet through a three-step address exchange on [`TAG_HANDSHAKE`]:
//! the client sends `[addr_len: u64 LE][addr_bytes]` to the pre-resolved
//! server address; the server receives it with an unspecified source,
//! inserts the address into its vector, and obtains the peer handle used for
//! all further traffic. Application payloads travel on [`TAG_MESSAGE`] and
//! broadcast payloads on [`TAG_BROADCAST`].

use log::*;

use crate::buffer::FabricBuf;
use crate::completion;
use crate::fabric::{
    Access, AddressVector, AvAttr, Caps, CompletionQueue, CqAttr, CqFormat, Domain, Endpoint,
    Fabric, Hints, Info, MemoryRegion, PeerAddr, Provider, ProviderKind, PEER_ANY,
};
use crate::{Error, Result, MAX_MSG_SIZE, TAG_HANDSHAKE, TAG_MESSAGE};

/// The fabric objects every reliable-datagram endpoint needs. The RPC layer
/// shares this bring-up.
pub(crate) struct RdmCore {
    // Field order is teardown order.
    pub(crate) av: Box<dyn AddressVector>,
    pub(crate) ep: Box<dyn Endpoint>,
    pub(crate) tx_cq: Box<dyn CompletionQueue>,
    pub(crate) rx_cq: Box<dyn CompletionQueue>,
    pub(crate) domain: Box<dyn Domain>,
    pub(crate) _fabric: Box<dyn Fabric>,
    pub(crate) info: Info,
}

impl RdmCore {
    pub(crate) fn open(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
        source: bool,
        caps: Caps,
    ) -> Result<RdmCore> {
        trace!("getting fabric info from provider {}", provider.name());
        let hints = Hints::rdm(kind, caps);
        let info = provider.get_info(Some(node), &port.to_string(), source, &hints)?;
        debug!("using provider: {}", info.fabric_name);

        trace!("creating fabric object");
        let fabric = provider.open_fabric(&info)?;
        trace!("creating domain");
        let domain = fabric.open_domain(&info)?;

        trace!("creating tx completion queue");
        let tx_cq = domain.open_completion_queue(&CqAttr {
            size: info.tx_size,
            format: CqFormat::Tagged,
        })?;
        trace!("creating rx completion queue");
        let rx_cq = domain.open_completion_queue(&CqAttr {
            size: info.rx_size,
            format: CqFormat::Tagged,
        })?;

        trace!("creating address vector");
        let av = domain.open_address_vector(&AvAttr { count: 1 })?;

        trace!("creating endpoint");
        let mut ep = domain.open_endpoint(&info)?;
        ep.bind_address_vector(av.as_ref())?;
        trace!("binding cqs to ep");
        ep.bind_completion_queues(tx_cq.as_ref(), rx_cq.as_ref())?;
        trace!("enabling ep");
        ep.enable()?;

        Ok(RdmCore {
            av,
            ep,
            tx_cq,
            rx_cq,
            domain,
            _fabric: fabric,
            info,
        })
    }

    /// Register `buf` for use with this endpoint, with provider-chosen key.
    /// Dropping the returned region closes the registration; the buffer must
    /// outlive it.
    pub(crate) fn register_mr(
        &self,
        buf: &mut dyn FabricBuf,
        access: Access,
    ) -> Result<Box<dyn MemoryRegion>> {
        // SAFETY: the caller keeps the buffer alive until the returned
        // region is dropped.
        let mr = unsafe { self.domain.mr_reg(buf.as_raw_mut(), buf.size(), access, 0)? };
        buf.register_callback(mr.key(), mr.descriptor());
        Ok(mr)
    }

    fn check_size(&self, buf: &dyn FabricBuf, size: usize) -> Result<()> {
        if size > MAX_MSG_SIZE {
            return Err(Error::MessageTooLarge {
                size,
                max: MAX_MSG_SIZE,
            });
        }
        assert!(size <= buf.size(), "operation runs past the end of the buffer");
        Ok(())
    }

    fn send_tag(&self, peer: PeerAddr, buf: &dyn FabricBuf, size: usize, tag: u64) -> Result<()> {
        self.check_size(buf, size)?;
        // SAFETY: the buffer outlives the posted operation; the completion
        // is drained before this returns.
        unsafe {
            self.ep
                .post_tagged_send(buf.as_raw(), size, buf.descriptor(), peer, tag)?
        };
        completion::wait_for_completion(self.tx_cq.as_ref())
    }

    fn recv_tag(
        &self,
        peer: PeerAddr,
        buf: &mut dyn FabricBuf,
        size: usize,
        tag: u64,
    ) -> Result<()> {
        self.check_size(buf, size)?;
        let desc = buf.descriptor();
        // SAFETY: the buffer outlives the posted operation; the completion
        // is drained before this returns.
        unsafe {
            self.ep
                .post_tagged_recv(buf.as_raw_mut(), size, desc, peer, tag)?
        };
        completion::wait_for_completion(self.rx_cq.as_ref())
    }
}

/// Server half of the connectionless engine: accepts address handshakes from
/// unknown peers and exchanges tagged messages with them afterwards.
///
/// Not safe for concurrent use from multiple threads.
pub struct ConnectionlessServer {
    core: RdmCore,
}

impl ConnectionlessServer {
    pub fn new(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
    ) -> Result<ConnectionlessServer> {
        let caps = Caps::MSG | Caps::TAGGED | Caps::DIRECTED_RECV;
        let core = RdmCore::open(provider, node, port, kind, true, caps)?;
        Ok(ConnectionlessServer { core })
    }

    /// Register `buf` with all access rights for use on this endpoint.
    pub fn register_mr(
        &self,
        buf: &mut dyn FabricBuf,
        access: Access,
    ) -> Result<Box<dyn MemoryRegion>> {
        self.core.register_mr(buf, access)
    }

    /// The provider-opaque address of this endpoint.
    pub fn local_addr(&self) -> Result<Vec<u8>> {
        self.core.ep.name()
    }

    /// Receive one address handshake, blocking. Must be paired with a
    /// client [`ConnectionlessClient::connect`]. Returns the handle for the
    /// new peer.
    pub fn accept(&mut self, buf: &mut dyn FabricBuf, size: usize) -> Result<PeerAddr> {
        self.async_accept(buf, size)?;
        self.wait_accept(buf, size)
    }

    /// Post the handshake receive without waiting. The buffer cannot be
    /// touched until [`ConnectionlessServer::wait_accept`] returns.
    pub fn async_accept(&mut self, buf: &mut dyn FabricBuf, size: usize) -> Result<()> {
        self.core.check_size(buf, size)?;
        trace!("server: posting handshake recv");
        let desc = buf.descriptor();
        let raw = buf.as_raw_mut();
        loop {
            // SAFETY: the buffer outlives the posted operation (it stays
            // untouched until wait_accept drains the completion).
            match unsafe {
                self.core
                    .ep
                    .post_tagged_recv(raw, size, desc, PEER_ANY, TAG_HANDSHAKE)
            } {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    trace!("handshake recv not posted, retrying: {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Wait for a handshake posted by
    /// [`ConnectionlessServer::async_accept`] and insert the received
    /// address into the address vector.
    pub fn wait_accept(&mut self, buf: &mut dyn FabricBuf, size: usize) -> Result<PeerAddr> {
        completion::wait_for_completion(self.core.rx_cq.as_ref())?;

        let mut len_bytes = [0u8; 8];
        buf.copy_from(&mut len_bytes, 0);
        let addr_len = u64::from_le_bytes(len_bytes) as usize;
        if addr_len == 0 || addr_len + 8 > size {
            return Err(Error::ConnectRejected(format!(
                "handshake declared {addr_len} address bytes in a {size}-byte message"
            )));
        }

        let mut addr = vec![0u8; addr_len];
        buf.copy_from(&mut addr, 8);

        trace!("server: adding client to av");
        let peer = self.core.av.insert(&addr)?;
        trace!("server: added client to av as {peer}");
        Ok(peer)
    }

    /// Receive an application message from `peer`, blocking.
    pub fn recv(&mut self, peer: PeerAddr, buf: &mut dyn FabricBuf, size: usize) -> Result<()> {
        trace!("server: posting recv");
        self.core.recv_tag(peer, buf, size, TAG_MESSAGE)
    }

    /// Receive an application message from `peer`; a failed post returns
    /// `false`. A successful post still blocks for the completion.
    pub fn try_recv(&mut self, peer: PeerAddr, buf: &mut dyn FabricBuf, size: usize) -> bool {
        self.try_recv_tag(peer, buf, size, TAG_MESSAGE)
    }

    /// Send an application message to `peer`, blocking for the transmit
    /// completion.
    pub fn send(&mut self, peer: PeerAddr, buf: &dyn FabricBuf, size: usize) -> Result<()> {
        trace!("server: posting send");
        self.core.send_tag(peer, buf, size, TAG_MESSAGE)
    }

    /// Send an application message to `peer`; a failed post returns
    /// `false`. A successful post still blocks for the completion.
    pub fn try_send(&mut self, peer: PeerAddr, buf: &dyn FabricBuf, size: usize) -> bool {
        self.try_send_tag(peer, buf, size, TAG_MESSAGE)
    }

    /// Post a send to `peer` without waiting. Pair with
    /// [`ConnectionlessServer::wait_send`].
    pub fn async_send(&mut self, peer: PeerAddr, buf: &dyn FabricBuf, size: usize) -> bool {
        trace!("server: posting send");
        if let Err(err) = self.core.check_size(buf, size) {
            trace!("send not posted: {err}");
            return false;
        }
        // SAFETY: the buffer outlives the posted operation; the caller waits
        // with wait_send before touching it.
        let res = unsafe {
            self.core
                .ep
                .post_tagged_send(buf.as_raw(), size, buf.descriptor(), peer, TAG_MESSAGE)
        };
        match res {
            Ok(()) => true,
            Err(err) => {
                trace!("send not posted: {err}");
                false
            }
        }
    }

    /// Wait for one send posted with [`ConnectionlessServer::async_send`].
    pub fn wait_send(&mut self) -> Result<()> {
        completion::wait_for_completion(self.core.tx_cq.as_ref())?;
        trace!("server: send completed");
        Ok(())
    }

    pub(crate) fn try_send_tag(
        &mut self,
        peer: PeerAddr,
        buf: &dyn FabricBuf,
        size: usize,
        tag: u64,
    ) -> bool {
        trace!("server: posting send");
        match self.core.send_tag(peer, buf, size, tag) {
            Ok(()) => {
                trace!("server: message sent");
                true
            }
            Err(err) => {
                trace!("server: message send failed: {err}");
                false
            }
        }
    }

    pub(crate) fn try_recv_tag(
        &mut self,
        peer: PeerAddr,
        buf: &mut dyn FabricBuf,
        size: usize,
        tag: u64,
    ) -> bool {
        trace!("server: posting recv");
        match self.core.recv_tag(peer, buf, size, tag) {
            Ok(()) => true,
            Err(err) => {
                trace!("server: message recv failed: {err}");
                false
            }
        }
    }
}

/// Client half of the connectionless engine. The server address is resolved
/// at construction; [`ConnectionlessClient::connect`] announces our own
/// address to the server.
///
/// Not safe for concurrent use from multiple threads.
pub struct ConnectionlessClient {
    core: RdmCore,
    remote: PeerAddr,
}

impl ConnectionlessClient {
    pub fn new(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
    ) -> Result<ConnectionlessClient> {
        let caps = Caps::MSG | Caps::TAGGED;
        let core = RdmCore::open(provider, node, port, kind, false, caps)?;

        let dest = core
            .info
            .dest_addr
            .clone()
            .ok_or_else(|| Error::Setup("resolved info has no destination address".into()))?;
        let remote = core.av.insert(&dest)?;

        Ok(ConnectionlessClient { core, remote })
    }

    /// Register `buf` for use on this endpoint.
    pub fn register_mr(
        &self,
        buf: &mut dyn FabricBuf,
        access: Access,
    ) -> Result<Box<dyn MemoryRegion>> {
        self.core.register_mr(buf, access)
    }

    /// The provider-opaque address of this endpoint.
    pub fn local_addr(&self) -> Result<Vec<u8>> {
        self.core.ep.name()
    }

    /// Announce this endpoint's address to the server, blocking until the
    /// handshake send completes. Must be paired with a server
    /// [`ConnectionlessServer::accept`].
    pub fn connect(&mut self, buf: &mut dyn FabricBuf, size: usize) -> Result<()> {
        let len = self.prepare_handshake(buf, size)?;
        loop {
            // SAFETY: the buffer outlives the posted operation; the
            // completion is drained below before returning.
            let res = unsafe {
                self.core.ep.post_tagged_send(
                    buf.as_raw(),
                    len,
                    buf.descriptor(),
                    self.remote,
                    TAG_HANDSHAKE,
                )
            };
            match res {
                Ok(()) => break,
                Err(err) if err.is_transient() => {
                    trace!("handshake send not posted, retrying: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        completion::wait_for_completion(self.core.tx_cq.as_ref())
    }

    /// Post the handshake send without waiting; retry on a `false` return.
    /// Pair with [`ConnectionlessClient::wait_connect`]. The buffer cannot
    /// be touched until the wait returns.
    pub fn async_connect(&mut self, buf: &mut dyn FabricBuf, size: usize) -> bool {
        let len = match self.prepare_handshake(buf, size) {
            Ok(len) => len,
            Err(err) => {
                trace!("handshake not prepared: {err}");
                return false;
            }
        };
        // SAFETY: the buffer outlives the posted operation; the caller waits
        // with wait_connect before touching it.
        let res = unsafe {
            self.core.ep.post_tagged_send(
                buf.as_raw(),
                len,
                buf.descriptor(),
                self.remote,
                TAG_HANDSHAKE,
            )
        };
        match res {
            Ok(()) => true,
            Err(err) => {
                trace!("handshake send not posted: {err}");
                false
            }
        }
    }

    /// Wait for the handshake posted by
    /// [`ConnectionlessClient::async_connect`] to complete.
    pub fn wait_connect(&mut self) -> Result<()> {
        completion::wait_for_completion(self.core.tx_cq.as_ref())
    }

    fn prepare_handshake(&self, buf: &mut dyn FabricBuf, size: usize) -> Result<usize> {
        let addr = self.core.ep.name()?;
        trace!(
            "client: sending {} address bytes to {}",
            addr.len(),
            self.remote
        );

        let len = 8 + addr.len();
        assert!(size >= len, "handshake needs {len} bytes, buffer offers {size}");
        self.core.check_size(buf, len)?;

        buf.copy_to(&(addr.len() as u64).to_le_bytes(), 0);
        buf.copy_to(&addr, 8);
        Ok(len)
    }

    /// Receive an application message from the server, blocking.
    pub fn recv(&mut self, buf: &mut dyn FabricBuf, size: usize) -> Result<()> {
        self.core.recv_tag(self.remote, buf, size, TAG_MESSAGE)
    }

    /// Send an application message to the server, blocking for the transmit
    /// completion.
    pub fn send(&mut self, buf: &dyn FabricBuf, size: usize) -> Result<()> {
        self.core.send_tag(self.remote, buf, size, TAG_MESSAGE)
    }

    /// Post a send without waiting. Pair with
    /// [`ConnectionlessClient::wait_send`].
    pub fn async_send(&mut self, buf: &dyn FabricBuf, size: usize) -> bool {
        trace!("client: posting send");
        if let Err(err) = self.core.check_size(buf, size) {
            trace!("send not posted: {err}");
            return false;
        }
        // SAFETY: the buffer outlives the posted operation; the caller waits
        // with wait_send before touching it.
        let res = unsafe {
            self.core.ep.post_tagged_send(
                buf.as_raw(),
                size,
                buf.descriptor(),
                self.remote,
                TAG_MESSAGE,
            )
        };
        match res {
            Ok(()) => true,
            Err(err) => {
                trace!("send not posted: {err}");
                false
            }
        }
    }

    /// Wait for one send posted with [`ConnectionlessClient::async_send`].
    pub fn wait_send(&mut self) -> Result<()> {
        completion::wait_for_completion(self.core.tx_cq.as_ref())?;
        trace!("client: send completed");
        Ok(())
    }

    pub(crate) fn try_send_tag(&mut self, buf: &dyn FabricBuf, size: usize, tag: u64) -> bool {
        trace!("client: posting send");
        match self.core.send_tag(self.remote, buf, size, tag) {
            Ok(()) => {
                trace!("client: message sent");
                true
            }
            Err(err) => {
                trace!("client: message send failed: {err}");
                false
            }
        }
    }

    pub(crate) fn try_recv_tag(&mut self, buf: &mut dyn FabricBuf, size: usize, tag: u64) -> bool {
        trace!("client: posting recv");
        match self.core.recv_tag(self.remote, buf, size, tag) {
            Ok(()) => {
                trace!("client: message received");
                true
            }
            Err(err) => {
                trace!("client: message recv failed: {err}");
                false
            }
        }
    }
}
