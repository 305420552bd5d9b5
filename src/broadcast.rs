// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Broadcast helpers over both transports.
//!
//! Best-effort broadcast fans a payload out to a set of peers, succeeding or
//! failing per peer independently. Reliable broadcast is best-effort at the
//! origin (the origin is assumed correct); redelivery is the receivers'
//! responsibility: [`reliable_broadcast_receive_from`] re-forwards the first
//! delivery of a message to the remaining peers, using a caller-supplied
//! predicate pair to de-duplicate.

use log::*;

use crate::buffer::FabricBuf;
use crate::connection::Connection;
use crate::connectionless::{ConnectionlessClient, ConnectionlessServer};
use crate::fabric::PeerAddr;
use crate::{Result, TAG_BROADCAST};

/// Send `size` bytes of `buf` over every connection, blocking on each.
pub fn best_effort_broadcast(
    connections: &mut [Connection],
    buf: &dyn FabricBuf,
    size: usize,
) -> Result<()> {
    trace!("sending best effort over {} connections", connections.len());
    for conn in connections.iter_mut() {
        conn.send(buf, size, 0)?;
    }
    Ok(())
}

/// Broadcast from a connectionless server to each address, retrying every
/// peer until its post is accepted.
pub fn best_effort_broadcast_from_server(
    server: &mut ConnectionlessServer,
    peers: &[PeerAddr],
    buf: &dyn FabricBuf,
    size: usize,
) {
    trace!("sending best effort from server to {} peers", peers.len());
    for &peer in peers {
        while !server.try_send_tag(peer, buf, size, TAG_BROADCAST) {}
    }
    trace!("sent best effort from server");
}

/// Broadcast through a set of client endpoints, retrying each until its
/// post is accepted.
pub fn best_effort_broadcast_from_clients(
    clients: &mut [ConnectionlessClient],
    buf: &dyn FabricBuf,
    size: usize,
) {
    trace!("sending best effort from {} clients", clients.len());
    for client in clients.iter_mut() {
        while !client.try_send_tag(buf, size, TAG_BROADCAST) {}
    }
    trace!("sent best effort from clients");
}

/// Receive one broadcast payload on a client endpoint.
pub fn best_effort_broadcast_receive(
    client: &mut ConnectionlessClient,
    buf: &mut dyn FabricBuf,
    size: usize,
) {
    while !client.try_recv_tag(buf, size, TAG_BROADCAST) {}
    trace!("received best effort on client");
}

/// Receive one broadcast payload from `peer` on a server endpoint.
pub fn best_effort_broadcast_receive_from(
    server: &mut ConnectionlessServer,
    peer: PeerAddr,
    buf: &mut dyn FabricBuf,
    size: usize,
) {
    while !server.try_recv_tag(peer, buf, size, TAG_BROADCAST) {}
    trace!("received best effort on server");
}

/// Reliable broadcast over connections. The origin is assumed correct, so
/// this is best-effort broadcast; receivers re-forward first deliveries.
pub fn reliable_broadcast(
    connections: &mut [Connection],
    buf: &dyn FabricBuf,
    size: usize,
) -> Result<()> {
    best_effort_broadcast(connections, buf, size)
}

/// Reliable broadcast from a connectionless server; see
/// [`reliable_broadcast`].
pub fn reliable_broadcast_from_server(
    server: &mut ConnectionlessServer,
    peers: &[PeerAddr],
    buf: &dyn FabricBuf,
    size: usize,
) {
    best_effort_broadcast_from_server(server, peers, buf, size)
}

/// Reliable broadcast through client endpoints; see [`reliable_broadcast`].
pub fn reliable_broadcast_from_clients(
    clients: &mut [ConnectionlessClient],
    buf: &dyn FabricBuf,
    size: usize,
) {
    best_effort_broadcast_from_clients(clients, buf, size)
}

/// Receive a broadcast over `receive_from`; if `check_seen` says the payload
/// is new, forward it to every connection in `forward_to` and record it with
/// `mark_seen`. Returns whether this was the first delivery.
pub fn reliable_broadcast_receive_from(
    receive_from: &mut Connection,
    forward_to: &mut [Connection],
    buf: &mut dyn FabricBuf,
    size: usize,
    mut check_seen: impl FnMut(&[u8]) -> bool,
    mut mark_seen: impl FnMut(&[u8]),
) -> Result<bool> {
    receive_from.recv(buf, size, 0)?;

    let mut payload = vec![0u8; size];
    buf.copy_from(&mut payload, 0);

    if check_seen(&payload) {
        return Ok(false);
    }
    best_effort_broadcast(forward_to, buf, size)?;
    mark_seen(&payload);
    Ok(true)
}

/// [`reliable_broadcast_receive_from`] for a client endpoint receiving from
/// its server and forwarding through other client endpoints.
pub fn reliable_broadcast_receive_from_clients(
    receive_from: &mut ConnectionlessClient,
    forward_to: &mut [ConnectionlessClient],
    buf: &mut dyn FabricBuf,
    size: usize,
    mut check_seen: impl FnMut(&[u8]) -> bool,
    mut mark_seen: impl FnMut(&[u8]),
) -> bool {
    while !receive_from.try_recv_tag(buf, size, TAG_BROADCAST) {}

    let mut payload = vec![0u8; size];
    buf.copy_from(&mut payload, 0);

    if check_seen(&payload) {
        return false;
    }
    best_effort_broadcast_from_clients(forward_to, buf, size);
    mark_seen(&payload);
    true
}

/// [`reliable_broadcast_receive_from`] for a server endpoint receiving from
/// one known peer and forwarding to the rest.
pub fn reliable_broadcast_receive_from_peers(
    server: &mut ConnectionlessServer,
    receive_from: PeerAddr,
    forward_to: &[PeerAddr],
    buf: &mut dyn FabricBuf,
    size: usize,
    mut check_seen: impl FnMut(&[u8]) -> bool,
    mut mark_seen: impl FnMut(&[u8]),
) -> bool {
    while !server.try_recv_tag(receive_from, buf, size, TAG_BROADCAST) {}

    let mut payload = vec![0u8; size];
    buf.copy_from(&mut payload, 0);

    if check_seen(&payload) {
        return false;
    }
    best_effort_broadcast_from_server(server, forward_to, buf, size);
    mark_seen(&payload);
    true
}
