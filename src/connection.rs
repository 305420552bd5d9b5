// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Connection-oriented endpoints: the two-role connect state machine, the
//! per-connection memory-region registry, and the message/RMA data plane.
//!
//! A passive connection is built with [`Connection::listen`] and an active
//! one with [`Connection::dial`]; both sides then call
//! [`Connection::connect`] to drive the event-queue handshake to
//! `Connected`. Data-plane operations require the `Connected` state and a
//! registered buffer.

use std::collections::HashMap;

use log::*;

use crate::buffer::FabricBuf;
use crate::completion::{self, Drained};
use crate::fabric::{
    Access, CompletionQueue, CqAttr, CqFormat, Domain, Endpoint, EqAttr, Event, EventQueue, Fabric,
    Hints, Info, MemoryRegion, PassiveEndpoint, Provider, ProviderKind, PEER_ANY,
};
use crate::{Error, Result, Role, MAX_MSG_SIZE};

/// Progression of a connection through setup. Data-plane operations are only
/// legal in `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Created,
    InfoResolved,
    FabricOpen,
    /// Passive side only: the passive endpoint is accepting requests.
    Listening,
    /// Passive side only: a request arrived and its info was adopted.
    ConnectRequestReceived,
    /// Active side only: the provider accepted our connect call.
    ConnectRequestSent,
    /// Active side only: endpoint enabled, ready to issue the request.
    EndpointEnabled,
    Connected,
    Closed,
}

/// A connection-oriented fabric endpoint.
///
/// The connection exclusively owns its fabric objects and its registered
/// memory regions; moving it transfers all of them. It is not safe for
/// concurrent use from multiple threads.
pub struct Connection {
    role: Role,
    state: ConnState,
    outstanding_sends: u64,
    // Field order is teardown order: regions first, then endpoint, queues,
    // domain, event queue, fabric.
    mrs: HashMap<u64, Box<dyn MemoryRegion>>,
    ep: Option<Box<dyn Endpoint>>,
    pep: Option<Box<dyn PassiveEndpoint>>,
    tx_cq: Option<Box<dyn CompletionQueue>>,
    rx_cq: Option<Box<dyn CompletionQueue>>,
    domain: Option<Box<dyn Domain>>,
    eq: Box<dyn EventQueue>,
    fabric: Box<dyn Fabric>,
    info: Info,
}

impl Connection {
    /// Create the passive side: resolve info for `node:port`, open the
    /// fabric, and start listening for a connection request.
    pub fn listen(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
    ) -> Result<Connection> {
        Connection::listen_with(provider, node, port, kind, || {})
    }

    /// Like [`Connection::listen`], invoking `on_listening` once the
    /// endpoint accepts requests. Useful to release a peer thread that must
    /// not dial before the listener exists.
    pub fn listen_with(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
        on_listening: impl FnOnce(),
    ) -> Result<Connection> {
        debug!("initializing passive connection on {node}:{port}");
        let hints = Hints::msg(kind);
        let info = provider.get_info(Some(node), &port.to_string(), true, &hints)?;
        trace!("resolved fabric info: {}", info.fabric_name);

        let fabric = provider.open_fabric(&info)?;
        trace!("opening event queue");
        let eq = fabric.open_event_queue(&EqAttr { size: 1 })?;

        trace!("creating passive endpoint");
        let mut pep = fabric.open_passive_endpoint(&info)?;
        trace!("binding eq to pep");
        pep.bind_event_queue(eq.as_ref())?;
        trace!("transitioning pep to listening state");
        pep.listen()?;
        on_listening();

        Ok(Connection {
            role: Role::Passive,
            state: ConnState::Listening,
            outstanding_sends: 0,
            mrs: HashMap::new(),
            ep: None,
            pep: Some(pep),
            tx_cq: None,
            rx_cq: None,
            domain: None,
            eq,
            fabric,
            info,
        })
    }

    /// Create the active side: resolve info with `node:port` as the
    /// destination and bring the endpoint up to `EndpointEnabled`.
    pub fn dial(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
    ) -> Result<Connection> {
        debug!("initializing active connection to {node}:{port}");
        let hints = Hints::msg(kind);
        let info = provider.get_info(Some(node), &port.to_string(), false, &hints)?;
        trace!("resolved fabric info: {}", info.fabric_name);

        let fabric = provider.open_fabric(&info)?;
        trace!("opening event queue");
        let eq = fabric.open_event_queue(&EqAttr { size: 1 })?;

        trace!("creating domain");
        let domain = fabric.open_domain(&info)?;
        trace!("creating active endpoint");
        let mut ep = domain.open_endpoint(&info)?;
        let (tx_cq, rx_cq) = open_cqs(domain.as_ref(), &info)?;
        ep.bind_completion_queues(tx_cq.as_ref(), rx_cq.as_ref())?;
        trace!("binding eq to ep");
        ep.bind_event_queue(eq.as_ref())?;
        trace!("enabling endpoint");
        ep.enable()?;

        Ok(Connection {
            role: Role::Active,
            state: ConnState::EndpointEnabled,
            outstanding_sends: 0,
            mrs: HashMap::new(),
            ep: Some(ep),
            pep: None,
            tx_cq: Some(tx_cq),
            rx_cq: Some(rx_cq),
            domain: Some(domain),
            eq,
            fabric,
            info,
        })
    }

    /// Drive the state machine to `Connected`.
    ///
    /// On the passive side this waits for a connection request, replaces the
    /// resolved info with the request's, opens the data-plane objects,
    /// closes the passive endpoint, and accepts. On the active side it
    /// issues the connect call. Both then wait for the `Connected` event.
    pub fn connect(&mut self) -> Result<()> {
        match (self.role, self.state) {
            (Role::Passive, ConnState::Listening) => self.accept_request(),
            (Role::Active, ConnState::EndpointEnabled) => self.issue_request(),
            (role, state) => Err(Error::Setup(format!(
                "connect on a {role} connection in state {state:?}"
            ))),
        }
    }

    fn accept_request(&mut self) -> Result<()> {
        trace!("waiting for connection request");
        let request = match self.eq.read(true)? {
            Some(Event::ConnRequest(info)) => info,
            Some(other) => {
                return Err(Error::ConnectRejected(format!(
                    "expected a connection request, event queue yielded {other:?}"
                )))
            }
            None => return Err(Error::ConnectRejected("event queue closed".into())),
        };
        trace!("connection request received");
        self.info = request;
        self.state = ConnState::ConnectRequestReceived;

        trace!("creating domain");
        let domain = self.fabric.open_domain(&self.info)?;
        trace!("creating active endpoint");
        let mut ep = domain.open_endpoint(&self.info)?;
        let (tx_cq, rx_cq) = open_cqs(domain.as_ref(), &self.info)?;
        ep.bind_completion_queues(tx_cq.as_ref(), rx_cq.as_ref())?;
        trace!("binding eq to ep");
        ep.bind_event_queue(self.eq.as_ref())?;
        trace!("enabling endpoint");
        ep.enable()?;

        trace!("closing passive endpoint");
        self.pep = None;

        trace!("accepting connection request");
        ep.accept()?;

        self.domain = Some(domain);
        self.tx_cq = Some(tx_cq);
        self.rx_cq = Some(rx_cq);
        self.ep = Some(ep);

        self.wait_connected()
    }

    fn issue_request(&mut self) -> Result<()> {
        let dest = self
            .info
            .dest_addr
            .clone()
            .ok_or_else(|| Error::Setup("resolved info has no destination address".into()))?;

        trace!("sending connection request");
        self.ep
            .as_mut()
            .expect("active connection has an endpoint")
            .connect(&dest)?;
        self.state = ConnState::ConnectRequestSent;

        self.wait_connected()
    }

    fn wait_connected(&mut self) -> Result<()> {
        trace!("reading eq for connected event");
        match self.eq.read(true)? {
            Some(Event::Connected) => {
                self.state = ConnState::Connected;
                debug!("{} side connected", self.role);
                Ok(())
            }
            Some(other) => Err(Error::ConnectRejected(format!(
                "expected the connected event, event queue yielded {other:?}"
            ))),
            None => Err(Error::ConnectRejected("event queue closed".into())),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Sends posted since the last full drain.
    pub fn outstanding_sends(&self) -> u64 {
        self.outstanding_sends
    }

    /// Register `buf` with the given access rights under `*key`.
    ///
    /// If no region with that key exists on this connection, one is created;
    /// the provider may rewrite the key (a requested key of zero always asks
    /// the provider to choose) and the final value is written back through
    /// `key` and the buffer callback. Returns `false` in this case.
    ///
    /// If a region with the key already exists it is closed first and the
    /// buffer is registered anew — this is how permissions are narrowed or
    /// widened. Returns `true` for such a rebind. Regions are strictly
    /// per-connection; a rebind here never affects other connections.
    ///
    /// The buffer must outlive the registration; the registry closes all
    /// regions on rebind and on drop, before the connection releases its
    /// domain.
    pub fn register(
        &mut self,
        buf: &mut dyn FabricBuf,
        access: Access,
        key: &mut u64,
    ) -> Result<bool> {
        let domain = self
            .domain
            .as_ref()
            .ok_or_else(|| Error::Setup("register before the domain is open".into()))?;

        let rebind = self.mrs.remove(key).is_some();
        if rebind {
            trace!("closed prior region for key {key:#x}");
        }

        // SAFETY: the caller keeps `buf` alive until the region is closed;
        // the registry drops every region before the domain goes away.
        let mr = unsafe { domain.mr_reg(buf.as_raw_mut(), buf.size(), access, *key)? };
        let final_key = mr.key();
        let desc = mr.descriptor();
        self.mrs.insert(final_key, mr);
        buf.register_callback(final_key, desc);
        trace!("registered {} bytes under key {final_key:#x}", buf.size());
        *key = final_key;

        Ok(rebind)
    }

    /// Send `size` bytes of `buf` starting at `offset`, blocking until the
    /// transmit completion — and any completions still owed to earlier
    /// `async_send` calls — have drained.
    pub fn send(&mut self, buf: &dyn FabricBuf, size: usize, offset: usize) -> Result<()> {
        self.post_send(buf, size, offset)?;
        self.wait_for_sends()
    }

    /// Post a send without waiting. The caller must not touch
    /// `buf[offset..offset + size]` until a later [`Connection::send`] or
    /// [`Connection::wait_for_sends`] drains the completion. Returns whether
    /// the post was accepted.
    pub fn async_send(&mut self, buf: &dyn FabricBuf, size: usize, offset: usize) -> bool {
        match self.post_send(buf, size, offset) {
            Ok(()) => true,
            Err(err) => {
                trace!("async send not posted: {err}");
                false
            }
        }
    }

    fn post_send(&mut self, buf: &dyn FabricBuf, size: usize, offset: usize) -> Result<()> {
        self.check_data_plane(buf, size, offset)?;
        let ep = self.ep.as_ref().expect("connected endpoint");
        // SAFETY: the buffer outlives the posted operation (caller contract)
        // and the range was bounds-checked above.
        unsafe { ep.post_send(buf.as_raw().add(offset), size, buf.descriptor(), PEER_ANY)? };
        self.outstanding_sends += 1;
        Ok(())
    }

    /// Block until every outstanding send completion has drained.
    pub fn wait_for_sends(&mut self) -> Result<()> {
        while self.outstanding_sends > 0 {
            completion::wait_for_completion(self.tx_cq())?;
            self.outstanding_sends -= 1;
        }
        Ok(())
    }

    /// Drain at most one send completion without blocking. Returns whether
    /// all outstanding sends have now completed.
    pub fn try_wait_for_sends(&mut self) -> Result<bool> {
        if self.outstanding_sends == 0 {
            return Ok(true);
        }
        if poll_one(self.tx_cq.as_deref().expect("connected endpoint has a tx cq"))? {
            self.outstanding_sends -= 1;
        }
        Ok(self.outstanding_sends == 0)
    }

    /// Post a receive for up to `max_len` bytes into `buf` at `offset` and
    /// block until it completes.
    pub fn recv(&mut self, buf: &mut dyn FabricBuf, max_len: usize, offset: usize) -> Result<()> {
        self.post_recv(buf, max_len, offset)?;
        completion::wait_for_completion(self.rx_cq())
    }

    /// Like [`Connection::recv`], but a post failure returns `false`
    /// immediately. A successful post still blocks for the completion.
    pub fn try_recv(&mut self, buf: &mut dyn FabricBuf, max_len: usize, offset: usize) -> bool {
        if let Err(err) = self.post_recv(buf, max_len, offset) {
            trace!("recv not posted: {err}");
            return false;
        }
        match completion::wait_for_completion(self.rx_cq()) {
            Ok(()) => true,
            Err(err) => {
                warn!("receive failed after post: {err}");
                false
            }
        }
    }

    fn post_recv(&mut self, buf: &mut dyn FabricBuf, max_len: usize, offset: usize) -> Result<()> {
        self.check_data_plane(buf, max_len, offset)?;
        let desc = buf.descriptor();
        let raw = buf.as_raw_mut();
        let ep = self.ep.as_ref().expect("connected endpoint");
        // SAFETY: the buffer outlives the posted operation and the range was
        // bounds-checked above.
        unsafe { ep.post_recv(raw.add(offset), max_len, desc, PEER_ANY) }
    }

    /// One-sided write of `size` bytes from `buf[offset..]` into the peer
    /// region `(remote_addr, remote_key)`, blocking for the transmit
    /// completion.
    pub fn write(
        &mut self,
        buf: &dyn FabricBuf,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        offset: usize,
    ) -> Result<()> {
        self.post_write(buf, size, remote_addr, remote_key, offset)?;
        completion::wait_for_completion(self.tx_cq())
    }

    /// One-sided read of `size` bytes from the peer region
    /// `(remote_addr, remote_key)` into `buf[offset..]`, blocking for the
    /// transmit completion.
    pub fn read(
        &mut self,
        buf: &mut dyn FabricBuf,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        offset: usize,
    ) -> Result<()> {
        self.post_read(buf, size, remote_addr, remote_key, offset)?;
        completion::wait_for_completion(self.tx_cq())
    }

    /// [`Connection::write`] that reports a failed issue as `false` instead
    /// of an error. A successful post still blocks for its completion.
    pub fn try_write(
        &mut self,
        buf: &dyn FabricBuf,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        offset: usize,
    ) -> bool {
        if let Err(err) = self.post_write(buf, size, remote_addr, remote_key, offset) {
            trace!("write not posted: {err}");
            return false;
        }
        match completion::wait_for_completion(self.tx_cq()) {
            Ok(()) => true,
            Err(err) => {
                warn!("write failed after post: {err}");
                false
            }
        }
    }

    /// [`Connection::read`] that reports a failed issue as `false` instead
    /// of an error. A successful post still blocks for its completion.
    pub fn try_read(
        &mut self,
        buf: &mut dyn FabricBuf,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        offset: usize,
    ) -> bool {
        if let Err(err) = self.post_read(buf, size, remote_addr, remote_key, offset) {
            trace!("read not posted: {err}");
            return false;
        }
        match completion::wait_for_completion(self.tx_cq()) {
            Ok(()) => true,
            Err(err) => {
                warn!("read failed after post: {err}");
                false
            }
        }
    }

    fn post_write(
        &mut self,
        buf: &dyn FabricBuf,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        offset: usize,
    ) -> Result<()> {
        self.check_data_plane(buf, size, offset)?;
        let ep = self.ep.as_ref().expect("connected endpoint");
        // SAFETY: the buffer outlives the posted operation and the range was
        // bounds-checked above.
        unsafe {
            ep.post_write(
                buf.as_raw().add(offset),
                size,
                buf.descriptor(),
                remote_addr,
                remote_key,
            )
        }
    }

    fn post_read(
        &mut self,
        buf: &mut dyn FabricBuf,
        size: usize,
        remote_addr: u64,
        remote_key: u64,
        offset: usize,
    ) -> Result<()> {
        self.check_data_plane(buf, size, offset)?;
        let desc = buf.descriptor();
        let raw = buf.as_raw_mut();
        let ep = self.ep.as_ref().expect("connected endpoint");
        // SAFETY: the buffer outlives the posted operation and the range was
        // bounds-checked above.
        unsafe { ep.post_read(raw.add(offset), size, desc, remote_addr, remote_key) }
    }

    fn check_data_plane(&self, buf: &dyn FabricBuf, size: usize, offset: usize) -> Result<()> {
        assert!(
            self.state == ConnState::Connected,
            "data-plane operation on a connection in state {:?}",
            self.state
        );
        if size + offset > MAX_MSG_SIZE {
            return Err(Error::MessageTooLarge {
                size: size + offset,
                max: MAX_MSG_SIZE,
            });
        }
        assert!(
            size + offset <= buf.size(),
            "operation runs past the end of the buffer"
        );
        debug_assert!(
            buf.is_registered(),
            "data-plane buffers must be registered first"
        );
        Ok(())
    }

    fn tx_cq(&self) -> &dyn CompletionQueue {
        self.tx_cq
            .as_deref()
            .expect("connected endpoint has a tx cq")
    }

    fn rx_cq(&self) -> &dyn CompletionQueue {
        self.rx_cq
            .as_deref()
            .expect("connected endpoint has an rx cq")
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("closing fabric objects for the {} side", self.role);
        // Regions must go before the domain; the remaining handles drop in
        // field order.
        self.mrs.clear();
        self.state = ConnState::Closed;
    }
}

fn open_cqs(
    domain: &dyn Domain,
    info: &Info,
) -> Result<(Box<dyn CompletionQueue>, Box<dyn CompletionQueue>)> {
    trace!("creating tx and rx completion queues");
    let tx = domain.open_completion_queue(&CqAttr {
        size: info.tx_size,
        format: CqFormat::Msg,
    })?;
    let rx = domain.open_completion_queue(&CqAttr {
        size: info.rx_size,
        format: CqFormat::Msg,
    })?;
    Ok((tx, rx))
}

fn poll_one(cq: &dyn CompletionQueue) -> Result<bool> {
    Ok(matches!(completion::poll_completion(cq)?, Drained::One))
}
