// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! An in-process provider implementing the whole [`fabric`](crate::fabric)
//! interface over shared state, so both sides of every transport can run in
//! one process. The test suite and the demo binaries are built on it.
//!
//! One [`LoopbackProvider`] value is an isolated network; clones share it.
//! Connection-oriented endpoints rendezvous by `node:service`, datagram
//! endpoints by provider-opaque address bytes. RMA resolves the peer
//! domain's region table by key and enforces the registered access rights
//! at post time.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::*;
use nix::errno::Errno;

use crate::fabric::{
    Access, AddressVector, AvAttr, Caps, CompletionQueue, ConnHandle, CqAttr, CqError, CqPoll,
    Domain, Endpoint, EndpointType, EqAttr, Event, EventQueue, Fabric, Hints, Info, LocalDesc,
    MemoryRegion, PassiveEndpoint, PeerAddr, Provider, ProviderKind, PEER_ANY,
};
use crate::{Error, Result};

/// Messages a queue buffers before posts start reporting "try again".
const QUEUE_CAP: usize = 1024;

/// Suggested completion-queue depth reported through resolved info.
const CQ_DEPTH: usize = 1024;

/// Pointer to caller memory lent to the provider for the duration of a
/// posted operation.
///
/// SAFETY: the post contract (see [`crate::fabric::Endpoint`]) keeps the
/// memory valid and unaliased until the matching completion is drained;
/// delivery may happen on whichever thread completes the transfer.
#[derive(Clone, Copy)]
struct RawMut(*mut u8);

unsafe impl Send for RawMut {}

// ---------------------------------------------------------------------------
// Queues

#[derive(Default)]
struct EqState {
    events: Mutex<VecDeque<Event>>,
}

impl EqState {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push_back(event);
    }
}

struct LoopbackEventQueue {
    state: Arc<EqState>,
}

impl EventQueue for LoopbackEventQueue {
    fn read(&self, blocking: bool) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.state.events.lock().unwrap().pop_front() {
                return Ok(Some(event));
            }
            if !blocking {
                return Ok(None);
            }
            thread::yield_now();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum CqEntry {
    Ok,
    Err(CqError),
}

#[derive(Default)]
struct CqState {
    entries: Mutex<VecDeque<CqEntry>>,
}

impl CqState {
    fn complete(&self) {
        self.entries.lock().unwrap().push_back(CqEntry::Ok);
    }

    fn fail(&self, errno: Errno, detail: String) {
        self.entries
            .lock()
            .unwrap()
            .push_back(CqEntry::Err(CqError {
                errno: errno as i32,
                detail,
            }));
    }
}

struct LoopbackCompletionQueue {
    state: Arc<CqState>,
}

impl CompletionQueue for LoopbackCompletionQueue {
    fn read(&self) -> CqPoll {
        match self.state.entries.lock().unwrap().pop_front() {
            Some(CqEntry::Ok) => CqPoll::Completed,
            Some(CqEntry::Err(err)) => CqPoll::Failed(err),
            None => CqPoll::WouldBlock,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Address vector

#[derive(Default)]
struct AvState {
    next: AtomicU64,
    map: Mutex<HashMap<PeerAddr, Vec<u8>>>,
}

impl AvState {
    fn lookup(&self, peer: PeerAddr) -> Option<Vec<u8>> {
        self.map.lock().unwrap().get(&peer).cloned()
    }
}

struct LoopbackAddressVector {
    state: Arc<AvState>,
}

impl AddressVector for LoopbackAddressVector {
    fn insert(&self, addr: &[u8]) -> Result<PeerAddr> {
        let handle = self.state.next.fetch_add(1, Ordering::Relaxed);
        self.state.map.lock().unwrap().insert(handle, addr.to_vec());
        Ok(handle)
    }

    fn remove(&self, peer: PeerAddr) -> Result<()> {
        match self.state.map.lock().unwrap().remove(&peer) {
            Some(_) => Ok(()),
            None => Err(Error::Setup(format!("unknown peer handle {peer}"))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Memory regions

struct MrEntry {
    base: RawMut,
    len: usize,
    access: Access,
}

#[derive(Default)]
struct MrTable {
    regions: Mutex<HashMap<u64, MrEntry>>,
}

struct LoopbackMemoryRegion {
    table: Arc<MrTable>,
    key: u64,
}

impl MemoryRegion for LoopbackMemoryRegion {
    fn key(&self) -> u64 {
        self.key
    }

    fn descriptor(&self) -> LocalDesc {
        LocalDesc(self.key)
    }
}

impl Drop for LoopbackMemoryRegion {
    fn drop(&mut self) {
        self.table.regions.lock().unwrap().remove(&self.key);
    }
}

// ---------------------------------------------------------------------------
// Connected message channels

struct PostedRecv {
    buf: RawMut,
    len: usize,
    cq: Arc<CqState>,
}

#[derive(Default)]
struct Inbox {
    pending: VecDeque<Vec<u8>>,
    posted: VecDeque<PostedRecv>,
}

#[derive(Default)]
struct SideSlots {
    inbox: Mutex<Inbox>,
    eq: Mutex<Option<Arc<EqState>>>,
    mrs: Mutex<Option<Arc<MrTable>>>,
}

struct MsgChannel {
    /// Index 0 is the connecting side, 1 the accepting side. Each slot
    /// holds traffic *to* that side.
    sides: [SideSlots; 2],
}

impl MsgChannel {
    fn new() -> MsgChannel {
        MsgChannel {
            sides: [SideSlots::default(), SideSlots::default()],
        }
    }
}

/// Connection-request token carried through [`Event::ConnRequest`].
struct ConnToken {
    channel: Arc<MsgChannel>,
}

// ---------------------------------------------------------------------------
// Datagram peers

struct RdmMessage {
    src: Vec<u8>,
    tag: Option<u64>,
    data: Vec<u8>,
}

struct PostedRdm {
    buf: RawMut,
    len: usize,
    tag: Option<u64>,
    /// `None` matches any source.
    src: Option<Vec<u8>>,
    cq: Arc<CqState>,
}

impl PostedRdm {
    fn matches(&self, msg: &RdmMessage) -> bool {
        self.tag == msg.tag && self.src.as_ref().map_or(true, |src| *src == msg.src)
    }
}

#[derive(Default)]
struct RdmInbox {
    unexpected: VecDeque<RdmMessage>,
    posted: Vec<PostedRdm>,
}

#[derive(Default)]
struct RdmPeer {
    inbox: Mutex<RdmInbox>,
}

// ---------------------------------------------------------------------------
// Network

struct ListenerSlot {
    eq: Arc<EqState>,
}

struct Network {
    /// Provider-chosen region keys start high so they stay clear of the
    /// small explicit keys applications pick.
    next_key: AtomicU64,
    next_ep: AtomicU64,
    listeners: Mutex<HashMap<Vec<u8>, ListenerSlot>>,
    rdm: Mutex<HashMap<Vec<u8>, Arc<RdmPeer>>>,
}

impl Network {
    fn new() -> Network {
        Network {
            next_key: AtomicU64::new(1 << 32),
            next_ep: AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
            rdm: Mutex::new(HashMap::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider, fabric, domain

/// An isolated in-process fabric. Clones address the same network.
#[derive(Clone)]
pub struct LoopbackProvider {
    net: Arc<Network>,
}

impl LoopbackProvider {
    pub fn new() -> LoopbackProvider {
        LoopbackProvider {
            net: Arc::new(Network::new()),
        }
    }
}

impl Default for LoopbackProvider {
    fn default() -> LoopbackProvider {
        LoopbackProvider::new()
    }
}

impl Provider for LoopbackProvider {
    fn name(&self) -> &str {
        "loopback"
    }

    fn get_info(
        &self,
        node: Option<&str>,
        service: &str,
        source: bool,
        hints: &Hints,
    ) -> Result<Info> {
        let supported = Caps::MSG | Caps::RMA | Caps::TAGGED | Caps::ATOMIC | Caps::DIRECTED_RECV;
        if !supported.contains(hints.caps) {
            return Err(Error::CapabilityUnavailable(format!(
                "requested {} but the loopback provider offers {}",
                hints.caps, supported
            )));
        }

        let addr = format!("{}:{service}", node.unwrap_or("localhost")).into_bytes();
        Ok(Info {
            provider: hints.provider,
            ep_type: hints.ep_type,
            caps: hints.caps,
            fabric_name: format!("loopback;{}", hints.provider),
            src_addr: source.then(|| addr.clone()),
            dest_addr: (!source).then_some(addr),
            tx_size: CQ_DEPTH,
            rx_size: CQ_DEPTH,
            handle: None,
        })
    }

    fn open_fabric(&self, _info: &Info) -> Result<Box<dyn Fabric>> {
        Ok(Box::new(LoopbackFabric {
            net: Arc::clone(&self.net),
        }))
    }
}

struct LoopbackFabric {
    net: Arc<Network>,
}

impl Fabric for LoopbackFabric {
    fn open_event_queue(&self, _attr: &EqAttr) -> Result<Box<dyn EventQueue>> {
        Ok(Box::new(LoopbackEventQueue {
            state: Arc::new(EqState::default()),
        }))
    }

    fn open_domain(&self, _info: &Info) -> Result<Box<dyn Domain>> {
        Ok(Box::new(LoopbackDomain {
            net: Arc::clone(&self.net),
            mrs: Arc::new(MrTable::default()),
        }))
    }

    fn open_passive_endpoint(&self, info: &Info) -> Result<Box<dyn PassiveEndpoint>> {
        let addr = info
            .src_addr
            .clone()
            .ok_or_else(|| Error::Setup("passive endpoint needs a source address".into()))?;
        Ok(Box::new(LoopbackPassiveEndpoint {
            net: Arc::clone(&self.net),
            addr,
            eq: None,
            listening: false,
        }))
    }
}

struct LoopbackDomain {
    net: Arc<Network>,
    mrs: Arc<MrTable>,
}

impl Domain for LoopbackDomain {
    fn open_endpoint(&self, info: &Info) -> Result<Box<dyn Endpoint>> {
        let (channel, side) = match info.handle.as_ref() {
            Some(handle) => {
                let token = handle
                    .downcast_ref::<ConnToken>()
                    .ok_or_else(|| Error::Setup("foreign connection-request handle".into()))?;
                (Some(Arc::clone(&token.channel)), 1)
            }
            None => (None, 0),
        };

        Ok(Box::new(LoopbackEndpoint {
            net: Arc::clone(&self.net),
            mrs: Arc::clone(&self.mrs),
            ep_type: info.ep_type,
            provider: info.provider,
            caps: info.caps,
            src_addr: info.src_addr.clone(),
            addr: Vec::new(),
            eq: None,
            tx_cq: None,
            rx_cq: None,
            av: None,
            channel,
            side,
            rdm: None,
        }))
    }

    fn open_completion_queue(&self, attr: &CqAttr) -> Result<Box<dyn CompletionQueue>> {
        trace!("opening completion queue ({:?}, depth {})", attr.format, attr.size);
        Ok(Box::new(LoopbackCompletionQueue {
            state: Arc::new(CqState::default()),
        }))
    }

    fn open_address_vector(&self, _attr: &AvAttr) -> Result<Box<dyn AddressVector>> {
        Ok(Box::new(LoopbackAddressVector {
            state: Arc::new(AvState::default()),
        }))
    }

    unsafe fn mr_reg(
        &self,
        addr: *mut u8,
        len: usize,
        access: Access,
        requested_key: u64,
    ) -> Result<Box<dyn MemoryRegion>> {
        let key = if requested_key != 0 {
            requested_key
        } else {
            self.net.next_key.fetch_add(1, Ordering::Relaxed)
        };

        self.mrs.regions.lock().unwrap().insert(
            key,
            MrEntry {
                base: RawMut(addr),
                len,
                access,
            },
        );
        trace!("registered {len} bytes under key {key:#x}");

        Ok(Box::new(LoopbackMemoryRegion {
            table: Arc::clone(&self.mrs),
            key,
        }))
    }
}

// ---------------------------------------------------------------------------
// Passive endpoint

struct LoopbackPassiveEndpoint {
    net: Arc<Network>,
    addr: Vec<u8>,
    eq: Option<Arc<EqState>>,
    listening: bool,
}

impl PassiveEndpoint for LoopbackPassiveEndpoint {
    fn bind_event_queue(&mut self, eq: &dyn EventQueue) -> Result<()> {
        self.eq = Some(downcast_eq(eq)?);
        Ok(())
    }

    fn listen(&mut self) -> Result<()> {
        let eq = self
            .eq
            .clone()
            .ok_or_else(|| Error::Setup("listen before binding an event queue".into()))?;

        let mut listeners = self.net.listeners.lock().unwrap();
        if listeners.contains_key(&self.addr) {
            return Err(Error::Setup(format!(
                "address {} already in use",
                String::from_utf8_lossy(&self.addr)
            )));
        }
        listeners.insert(self.addr.clone(), ListenerSlot { eq });
        self.listening = true;
        Ok(())
    }
}

impl Drop for LoopbackPassiveEndpoint {
    fn drop(&mut self) {
        if self.listening {
            self.net.listeners.lock().unwrap().remove(&self.addr);
        }
    }
}

// ---------------------------------------------------------------------------
// Active endpoint

struct LoopbackEndpoint {
    net: Arc<Network>,
    mrs: Arc<MrTable>,
    ep_type: EndpointType,
    provider: ProviderKind,
    caps: Caps,
    /// Source address from the resolved info, claimed at enable time for
    /// datagram endpoints.
    src_addr: Option<Vec<u8>>,
    addr: Vec<u8>,
    eq: Option<Arc<EqState>>,
    tx_cq: Option<Arc<CqState>>,
    rx_cq: Option<Arc<CqState>>,
    av: Option<Arc<AvState>>,
    channel: Option<Arc<MsgChannel>>,
    side: usize,
    rdm: Option<Arc<RdmPeer>>,
}

impl LoopbackEndpoint {
    fn tx(&self) -> Result<&Arc<CqState>> {
        self.tx_cq
            .as_ref()
            .ok_or_else(|| Error::Setup("no transmit queue bound".into()))
    }

    fn rx(&self) -> Result<&Arc<CqState>> {
        self.rx_cq
            .as_ref()
            .ok_or_else(|| Error::Setup("no receive queue bound".into()))
    }

    fn channel(&self) -> Result<&Arc<MsgChannel>> {
        self.channel
            .as_ref()
            .ok_or_else(|| Error::Setup("endpoint is not connected".into()))
    }

    fn peer_mrs(&self) -> Result<Arc<MrTable>> {
        let channel = self.channel()?;
        channel.sides[1 - self.side]
            .mrs
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Setup("peer has not published its regions".into()))
    }

    /// Resolve an address-vector handle to address bytes.
    fn resolve(&self, peer: PeerAddr) -> Result<Vec<u8>> {
        let av = self
            .av
            .as_ref()
            .ok_or_else(|| Error::Setup("no address vector bound".into()))?;
        av.lookup(peer)
            .ok_or_else(|| Error::Setup(format!("unknown peer handle {peer}")))
    }

    /// Hand a message to a connected peer: straight into a posted receive
    /// when one is waiting, otherwise onto the pending queue.
    fn deliver_msg(&self, data: Vec<u8>) -> Result<()> {
        let channel = self.channel()?;
        let slot = &channel.sides[1 - self.side];
        let mut inbox = slot.inbox.lock().unwrap();

        if let Some(posted) = inbox.posted.pop_front() {
            complete_recv(&posted.cq, posted.buf, posted.len, &data);
        } else {
            if inbox.pending.len() >= QUEUE_CAP {
                return Err(Error::TransientPost { op: "send" });
            }
            inbox.pending.push_back(data);
        }
        Ok(())
    }

    fn deliver_rdm(&self, dest: PeerAddr, tag: Option<u64>, data: Vec<u8>) -> Result<()> {
        let addr = self.resolve(dest)?;
        let target = self
            .net
            .rdm
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or(Error::TransientPost { op: "tagged send" })?;

        let msg = RdmMessage {
            src: self.addr.clone(),
            tag,
            data,
        };

        let mut inbox = target.inbox.lock().unwrap();
        if let Some(at) = inbox.posted.iter().position(|posted| posted.matches(&msg)) {
            let posted = inbox.posted.remove(at);
            complete_recv(&posted.cq, posted.buf, posted.len, &msg.data);
        } else {
            if inbox.unexpected.len() >= QUEUE_CAP {
                return Err(Error::TransientPost { op: "tagged send" });
            }
            inbox.unexpected.push_back(msg);
        }
        Ok(())
    }

    fn post_rdm_recv(
        &self,
        buf: RawMut,
        len: usize,
        tag: Option<u64>,
        src: PeerAddr,
    ) -> Result<()> {
        let rx = self.rx()?.clone();
        let src = if src == PEER_ANY {
            None
        } else {
            Some(self.resolve(src)?)
        };
        let rdm = self
            .rdm
            .as_ref()
            .ok_or_else(|| Error::Setup("endpoint is not enabled".into()))?;

        let posted = PostedRdm {
            buf,
            len,
            tag,
            src,
            cq: rx,
        };

        let mut inbox = rdm.inbox.lock().unwrap();
        if let Some(at) = inbox
            .unexpected
            .iter()
            .position(|msg| posted.matches(msg))
        {
            let msg = inbox.unexpected.remove(at).expect("position was valid");
            complete_recv(&posted.cq, posted.buf, posted.len, &msg.data);
        } else {
            inbox.posted.push(posted);
        }
        Ok(())
    }
}

impl Endpoint for LoopbackEndpoint {
    fn bind_event_queue(&mut self, eq: &dyn EventQueue) -> Result<()> {
        self.eq = Some(downcast_eq(eq)?);
        Ok(())
    }

    fn bind_completion_queues(
        &mut self,
        tx: &dyn CompletionQueue,
        rx: &dyn CompletionQueue,
    ) -> Result<()> {
        self.tx_cq = Some(downcast_cq(tx)?);
        self.rx_cq = Some(downcast_cq(rx)?);
        Ok(())
    }

    fn bind_address_vector(&mut self, av: &dyn AddressVector) -> Result<()> {
        let av = av
            .as_any()
            .downcast_ref::<LoopbackAddressVector>()
            .ok_or_else(|| Error::Setup("foreign address vector".into()))?;
        self.av = Some(Arc::clone(&av.state));
        Ok(())
    }

    fn enable(&mut self) -> Result<()> {
        self.tx()?;
        self.rx()?;

        if self.ep_type == EndpointType::Rdm && self.rdm.is_none() {
            // Claim an address on the network: the resolved source address
            // for receivers, a fresh one otherwise.
            let addr = match &self.src_addr {
                Some(addr) => addr.clone(),
                None => format!("lo-ep-{}", self.net.next_ep.fetch_add(1, Ordering::Relaxed))
                    .into_bytes(),
            };

            let peer = Arc::new(RdmPeer::default());
            let mut rdm = self.net.rdm.lock().unwrap();
            if rdm.contains_key(&addr) {
                return Err(Error::Setup(format!(
                    "address {} already in use",
                    String::from_utf8_lossy(&addr)
                )));
            }
            rdm.insert(addr.clone(), Arc::clone(&peer));
            drop(rdm);

            self.addr = addr;
            self.rdm = Some(peer);
        }
        Ok(())
    }

    fn connect(&mut self, dest: &[u8]) -> Result<()> {
        assert!(
            self.ep_type == EndpointType::Msg,
            "connect on a datagram endpoint"
        );
        let eq = self
            .eq
            .clone()
            .ok_or_else(|| Error::Setup("connect before binding an event queue".into()))?;

        let listener_eq = self
            .net
            .listeners
            .lock()
            .unwrap()
            .get(dest)
            .map(|slot| Arc::clone(&slot.eq))
            .ok_or_else(|| {
                Error::ConnectRejected(format!(
                    "no listener at {}",
                    String::from_utf8_lossy(dest)
                ))
            })?;

        let channel = Arc::new(MsgChannel::new());
        *channel.sides[0].eq.lock().unwrap() = Some(eq);
        *channel.sides[0].mrs.lock().unwrap() = Some(Arc::clone(&self.mrs));
        self.channel = Some(Arc::clone(&channel));
        self.side = 0;

        listener_eq.push(Event::ConnRequest(Info {
            provider: self.provider,
            ep_type: self.ep_type,
            caps: self.caps,
            fabric_name: format!("loopback;{}", self.provider),
            src_addr: None,
            dest_addr: None,
            tx_size: CQ_DEPTH,
            rx_size: CQ_DEPTH,
            handle: Some(ConnHandle::new(ConnToken { channel })),
        }));
        Ok(())
    }

    fn accept(&mut self) -> Result<()> {
        let eq = self
            .eq
            .clone()
            .ok_or_else(|| Error::Setup("accept before binding an event queue".into()))?;
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| Error::Setup("accept without a connection request".into()))?;

        *channel.sides[self.side].eq.lock().unwrap() = Some(Arc::clone(&eq));
        *channel.sides[self.side].mrs.lock().unwrap() = Some(Arc::clone(&self.mrs));

        let peer_eq = channel.sides[1 - self.side]
            .eq
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::ConnectRejected("the requesting side went away".into()))?;

        peer_eq.push(Event::Connected);
        eq.push(Event::Connected);
        Ok(())
    }

    fn name(&self) -> Result<Vec<u8>> {
        if self.addr.is_empty() {
            return Err(Error::Setup("endpoint has no address before enable".into()));
        }
        Ok(self.addr.clone())
    }

    unsafe fn post_send(
        &self,
        buf: *const u8,
        len: usize,
        _desc: Option<LocalDesc>,
        dest: PeerAddr,
    ) -> Result<()> {
        // Snapshot at post time; the wire copy is what gets delivered.
        let data = slice::from_raw_parts(buf, len).to_vec();
        match self.ep_type {
            EndpointType::Msg => self.deliver_msg(data)?,
            EndpointType::Rdm => self.deliver_rdm(dest, None, data)?,
        }
        self.tx()?.complete();
        Ok(())
    }

    unsafe fn post_recv(
        &self,
        buf: *mut u8,
        len: usize,
        _desc: Option<LocalDesc>,
        src: PeerAddr,
    ) -> Result<()> {
        match self.ep_type {
            EndpointType::Msg => {
                let rx = self.rx()?.clone();
                let channel = self.channel()?;
                let mut inbox = channel.sides[self.side].inbox.lock().unwrap();
                if let Some(data) = inbox.pending.pop_front() {
                    complete_recv(&rx, RawMut(buf), len, &data);
                } else {
                    inbox.posted.push_back(PostedRecv {
                        buf: RawMut(buf),
                        len,
                        cq: rx,
                    });
                }
                Ok(())
            }
            EndpointType::Rdm => self.post_rdm_recv(RawMut(buf), len, None, src),
        }
    }

    unsafe fn post_read(
        &self,
        buf: *mut u8,
        len: usize,
        _desc: Option<LocalDesc>,
        remote_addr: u64,
        key: u64,
    ) -> Result<()> {
        let tx = self.tx()?.clone();
        let table = self.peer_mrs()?;
        let regions = table.regions.lock().unwrap();

        let Some(entry) = regions.get(&key) else {
            tx.fail(Errno::EINVAL, format!("no region registered under key {key:#x}"));
            return Ok(());
        };
        if !entry.access.contains(Access::REMOTE_READ) {
            return Err(Error::PermissionDenied(format!(
                "region {key:#x} does not grant remote read"
            )));
        }
        let offset = remote_addr as usize;
        if offset + len > entry.len {
            tx.fail(
                Errno::EFAULT,
                format!("read of {len} bytes at {offset} overruns the {}-byte region", entry.len),
            );
            return Ok(());
        }

        // SAFETY: the region memory is valid while registered (mr_reg
        // contract) and the range was bounds-checked above.
        ptr::copy(entry.base.0.add(offset), buf, len);
        tx.complete();
        Ok(())
    }

    unsafe fn post_write(
        &self,
        buf: *const u8,
        len: usize,
        _desc: Option<LocalDesc>,
        remote_addr: u64,
        key: u64,
    ) -> Result<()> {
        let tx = self.tx()?.clone();
        let table = self.peer_mrs()?;
        let regions = table.regions.lock().unwrap();

        let Some(entry) = regions.get(&key) else {
            tx.fail(Errno::EINVAL, format!("no region registered under key {key:#x}"));
            return Ok(());
        };
        if !entry.access.contains(Access::REMOTE_WRITE) {
            return Err(Error::PermissionDenied(format!(
                "region {key:#x} does not grant remote write"
            )));
        }
        let offset = remote_addr as usize;
        if offset + len > entry.len {
            tx.fail(
                Errno::EFAULT,
                format!("write of {len} bytes at {offset} overruns the {}-byte region", entry.len),
            );
            return Ok(());
        }

        // SAFETY: the region memory is valid while registered (mr_reg
        // contract) and the range was bounds-checked above.
        ptr::copy(buf, entry.base.0.add(offset), len);
        tx.complete();
        Ok(())
    }

    unsafe fn post_tagged_send(
        &self,
        buf: *const u8,
        len: usize,
        _desc: Option<LocalDesc>,
        dest: PeerAddr,
        tag: u64,
    ) -> Result<()> {
        assert!(
            self.ep_type == EndpointType::Rdm,
            "tagged send on a connected endpoint"
        );
        let data = slice::from_raw_parts(buf, len).to_vec();
        self.deliver_rdm(dest, Some(tag), data)?;
        self.tx()?.complete();
        Ok(())
    }

    unsafe fn post_tagged_recv(
        &self,
        buf: *mut u8,
        len: usize,
        _desc: Option<LocalDesc>,
        src: PeerAddr,
        tag: u64,
    ) -> Result<()> {
        assert!(
            self.ep_type == EndpointType::Rdm,
            "tagged recv on a connected endpoint"
        );
        self.post_rdm_recv(RawMut(buf), len, Some(tag), src)
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        if !self.addr.is_empty() {
            self.net.rdm.lock().unwrap().remove(&self.addr);
        }
        if let Some(channel) = &self.channel {
            // Tell a still-listening peer the connection is gone.
            if let Some(peer_eq) = channel.sides[1 - self.side].eq.lock().unwrap().clone() {
                peer_eq.push(Event::Shutdown);
            }
        }
    }
}

/// Copy a delivered payload into a posted receive buffer and complete it,
/// or fail the completion when the payload does not fit.
fn complete_recv(cq: &Arc<CqState>, buf: RawMut, len: usize, data: &[u8]) {
    if data.len() > len {
        cq.fail(
            Errno::EMSGSIZE,
            format!("{}-byte message truncated by a {len}-byte receive", data.len()),
        );
        return;
    }
    // SAFETY: the posted buffer is lent to the provider until its completion
    // is drained, which happens only after this copy.
    unsafe { ptr::copy(data.as_ptr(), buf.0, data.len()) };
    cq.complete();
}

fn downcast_eq(eq: &dyn EventQueue) -> Result<Arc<EqState>> {
    eq.as_any()
        .downcast_ref::<LoopbackEventQueue>()
        .map(|eq| Arc::clone(&eq.state))
        .ok_or_else(|| Error::Setup("foreign event queue".into()))
}

fn downcast_cq(cq: &dyn CompletionQueue) -> Result<Arc<CqState>> {
    cq.as_any()
        .downcast_ref::<LoopbackCompletionQueue>()
        .map(|cq| Arc::clone(&cq.state))
        .ok_or_else(|| Error::Setup("foreign completion queue".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::CqFormat;

    fn rdm_endpoint(provider: &LoopbackProvider, node: &str, port: u16) -> Box<dyn Endpoint> {
        let hints = Hints::rdm(ProviderKind::Sockets, Caps::MSG | Caps::TAGGED);
        let info = provider
            .get_info(Some(node), &port.to_string(), true, &hints)
            .unwrap();
        let fabric = provider.open_fabric(&info).unwrap();
        let domain = fabric.open_domain(&info).unwrap();
        let tx = domain
            .open_completion_queue(&CqAttr { size: 16, format: CqFormat::Tagged })
            .unwrap();
        let rx = domain
            .open_completion_queue(&CqAttr { size: 16, format: CqFormat::Tagged })
            .unwrap();
        let av = domain.open_address_vector(&AvAttr { count: 1 }).unwrap();
        let mut ep = domain.open_endpoint(&info).unwrap();
        ep.bind_address_vector(av.as_ref()).unwrap();
        ep.bind_completion_queues(tx.as_ref(), rx.as_ref()).unwrap();
        ep.enable().unwrap();
        // The queue state lives on through the Arcs inside the endpoint.
        ep
    }

    #[test]
    fn info_reflects_direction() {
        let provider = LoopbackProvider::new();
        let hints = Hints::msg(ProviderKind::Sockets);

        let listen = provider.get_info(Some("a"), "8080", true, &hints).unwrap();
        assert_eq!(listen.src_addr.as_deref(), Some(b"a:8080".as_slice()));
        assert!(listen.dest_addr.is_none());

        let dial = provider.get_info(Some("a"), "8080", false, &hints).unwrap();
        assert_eq!(dial.dest_addr.as_deref(), Some(b"a:8080".as_slice()));
        assert!(dial.src_addr.is_none());
    }

    #[test]
    fn rdm_addresses_are_unique_per_network() {
        let provider = LoopbackProvider::new();
        let a = rdm_endpoint(&provider, "a", 9000);
        let b = rdm_endpoint(&provider, "b", 9000);
        assert_ne!(a.name().unwrap(), b.name().unwrap());
    }

    #[test]
    fn address_vector_insert_remove() {
        let av = LoopbackAddressVector {
            state: Arc::new(AvState::default()),
        };
        let peer = av.insert(b"somewhere:1").unwrap();
        assert_eq!(av.state.lookup(peer).as_deref(), Some(b"somewhere:1".as_slice()));
        av.remove(peer).unwrap();
        assert!(av.remove(peer).is_err());
    }

    #[test]
    fn tagged_delivery_waits_for_matching_tag() {
        let provider = LoopbackProvider::new();
        let a = rdm_endpoint(&provider, "a", 9100);
        let b = rdm_endpoint(&provider, "b", 9100);

        // a sends tag 2 to b before any receive is posted.
        let av_a = LoopbackAddressVector {
            state: Arc::new(AvState::default()),
        };
        let b_handle = av_a.insert(&b.name().unwrap()).unwrap();
        // Rebind a's av so resolve() sees the handle.
        let mut a = a;
        a.bind_address_vector(&av_a).unwrap();

        let payload = *b"tagged";
        // SAFETY: the payload and receive buffer outlive both posts; the
        // completions are drained synchronously by the loopback provider.
        unsafe {
            a.post_tagged_send(payload.as_ptr(), payload.len(), None, b_handle, 2)
                .unwrap();

            let mut got = [0u8; 16];
            // A tag-1 receive must not match the queued tag-2 message.
            b.post_tagged_recv(got.as_mut_ptr(), got.len(), None, PEER_ANY, 1)
                .unwrap();
            assert_eq!(&got[..6], b"\0\0\0\0\0\0");

            let mut got2 = [0u8; 16];
            b.post_tagged_recv(got2.as_mut_ptr(), got2.len(), None, PEER_ANY, 2)
                .unwrap();
            assert_eq!(&got2[..6], b"tagged");
        }
    }
}
