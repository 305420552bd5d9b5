// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Two-sided connection scenarios over the loopback provider. Each side runs
//! on its own thread; mpsc channels sequence the steps that the transport
//! itself does not order.

use std::sync::mpsc;
use std::thread;

use fabric_layer::connection::ConnState;
use fabric_layer::{
    Access, Connection, Error, FabricBuf, LoopbackProvider, ProviderKind, UniqueBuf,
};

const PORT: u16 = 8080;

/// Spawn a passive side, wait until it listens, and dial it.
fn connect_pair<F, T>(provider: &LoopbackProvider, server: F) -> (Connection, thread::JoinHandle<T>)
where
    F: FnOnce(Connection) -> T + Send + 'static,
    T: Send + 'static,
{
    let (listening_tx, listening_rx) = mpsc::channel();
    let server_provider = provider.clone();
    let handle = thread::spawn(move || {
        let mut conn = Connection::listen_with(
            &server_provider,
            "127.0.0.1",
            PORT,
            ProviderKind::Sockets,
            || listening_tx.send(()).unwrap(),
        )
        .unwrap();
        conn.connect().unwrap();
        server(conn)
    });

    listening_rx.recv().unwrap();
    let mut conn = Connection::dial(provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    conn.connect().unwrap();
    assert_eq!(conn.state(), ConnState::Connected);

    (conn, handle)
}

fn registered_buf(conn: &mut Connection) -> UniqueBuf {
    let mut buf = UniqueBuf::new();
    let mut key = 0u64;
    conn.register(&mut buf, Access::all(), &mut key).unwrap();
    buf
}

#[test]
fn message_echo() {
    let provider = LoopbackProvider::new();

    let (mut client, server) = connect_pair(&provider, |mut conn| {
        let mut buf = registered_buf(&mut conn);
        conn.recv(&mut buf, 128, 0).unwrap();
        assert_eq!(&buf.bytes()[..7], b"potato\0");
    });

    let mut buf = registered_buf(&mut client);
    buf.assign("potato");
    client.send(&buf, 7, 0).unwrap();

    server.join().unwrap();
}

#[test]
fn request_reply() {
    let provider = LoopbackProvider::new();

    let (mut client, server) = connect_pair(&provider, |mut conn| {
        let mut buf = registered_buf(&mut conn);
        conn.recv(&mut buf, 128, 0).unwrap();
        assert_eq!(&buf.bytes()[..5], b"ping\0");

        buf.assign("pong");
        conn.send(&buf, 5, 0).unwrap();
    });

    let mut buf = registered_buf(&mut client);
    buf.assign("ping");
    client.send(&buf, 5, 0).unwrap();

    client.recv(&mut buf, 128, 0).unwrap();
    assert_eq!(&buf.bytes()[..5], b"pong\0");

    server.join().unwrap();
}

#[test]
fn outstanding_sends_drain_to_zero() {
    let provider = LoopbackProvider::new();

    let (done_tx, done_rx) = mpsc::channel();
    let (mut client, server) = connect_pair(&provider, move |mut conn| {
        let mut buf = registered_buf(&mut conn);
        done_rx.recv().unwrap();
        conn.recv(&mut buf, 128, 0).unwrap();
        conn.recv(&mut buf, 128, 0).unwrap();
    });

    let mut buf = registered_buf(&mut client);
    buf.assign("hi");

    assert!(client.async_send(&buf, 3, 0));
    assert!(client.async_send(&buf, 3, 0));
    assert_eq!(client.outstanding_sends(), 2);

    client.wait_for_sends().unwrap();
    assert_eq!(client.outstanding_sends(), 0);

    // With nothing outstanding the try variant reports done immediately.
    assert!(client.try_wait_for_sends().unwrap());

    done_tx.send(()).unwrap();
    server.join().unwrap();
}

#[test]
fn rma_round_trip() {
    let provider = LoopbackProvider::new();

    let (read_tx, read_rx) = mpsc::channel();
    let (written_tx, written_rx) = mpsc::channel();
    let (mut client, server) = connect_pair(&provider, move |mut conn| {
        let mut buf = UniqueBuf::new();
        buf.copy_to(&u64::MAX.to_le_bytes(), 0);
        let mut key = 1u64;
        conn.register(&mut buf, Access::all(), &mut key).unwrap();
        assert_eq!(key, 1);

        read_tx.send(()).unwrap();
        written_rx.recv().unwrap();

        let mut value = [0u8; 8];
        buf.copy_from(&mut value, 0);
        assert_eq!(u64::from_le_bytes(value), 0);
    });

    let mut buf = registered_buf(&mut client);
    read_rx.recv().unwrap();

    client.read(&mut buf, 8, 0, 1, 0).unwrap();
    let mut value = [0u8; 8];
    buf.copy_from(&mut value, 0);
    assert_eq!(u64::from_le_bytes(value), u64::MAX);

    buf.copy_to(&0u64.to_le_bytes(), 0);
    client.write(&buf, 8, 0, 1, 0).unwrap();
    written_tx.send(()).unwrap();

    server.join().unwrap();
}

/// Scenario: one owner serving the same buffer to two peers narrows one
/// peer's rights to read-only; that peer's writes fail while its reads keep
/// working, and the other peer is unaffected.
#[test]
fn permission_downgrade_is_per_connection() {
    let provider = LoopbackProvider::new();

    let (ready_b_tx, ready_b_rx) = mpsc::channel();
    let (ready_c_tx, ready_c_rx) = mpsc::channel();
    let (registered_tx, registered_rx) = mpsc::channel();
    let (wrote_tx, wrote_rx) = mpsc::channel();
    let (rebound_tx, rebound_rx) = mpsc::channel();

    let owner_provider = provider.clone();
    let owner = thread::spawn(move || {
        let mut conn_b = Connection::listen_with(
            &owner_provider,
            "127.0.0.1",
            PORT,
            ProviderKind::Sockets,
            || ready_b_tx.send(()).unwrap(),
        )
        .unwrap();
        conn_b.connect().unwrap();

        let mut conn_c = Connection::listen_with(
            &owner_provider,
            "127.0.0.1",
            PORT,
            ProviderKind::Sockets,
            || ready_c_tx.send(()).unwrap(),
        )
        .unwrap();
        conn_c.connect().unwrap();

        let mut buf = UniqueBuf::new();
        buf.copy_to(&5u64.to_le_bytes(), 0);
        let mut key_b = 2u64;
        assert!(!conn_b.register(&mut buf, Access::all(), &mut key_b).unwrap());
        let mut key_c = 2u64;
        assert!(!conn_c.register(&mut buf, Access::all(), &mut key_c).unwrap());
        registered_tx.send(()).unwrap();

        wrote_rx.recv().unwrap();
        let mut value = [0u8; 8];
        buf.copy_from(&mut value, 0);
        assert_eq!(u64::from_le_bytes(value), 100);

        // Narrow C's rights; B's region is untouched.
        let mut key_c = 2u64;
        let rebound = conn_c
            .register(&mut buf, Access::LOCAL_READ | Access::REMOTE_READ, &mut key_c)
            .unwrap();
        assert!(rebound);
        assert_eq!(key_c, 2);
        rebound_tx.send(()).unwrap();

        // Keep the connections, their regions, and the backing buffer alive
        // until the peers finish their one-sided operations.
        (conn_b, conn_c, buf)
    });

    ready_b_rx.recv().unwrap();
    let mut conn_b = Connection::dial(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    conn_b.connect().unwrap();

    ready_c_rx.recv().unwrap();
    let mut conn_c = Connection::dial(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    conn_c.connect().unwrap();

    registered_rx.recv().unwrap();

    let mut buf_b = registered_buf(&mut conn_b);
    buf_b.copy_to(&100u64.to_le_bytes(), 0);
    conn_b.write(&buf_b, 8, 0, 2, 0).unwrap();
    wrote_tx.send(()).unwrap();

    rebound_rx.recv().unwrap();

    let mut buf_c = registered_buf(&mut conn_c);
    buf_c.copy_to(&7u64.to_le_bytes(), 0);
    assert!(!conn_c.try_write(&buf_c, 8, 0, 2, 0));

    // Reads against the downgraded region still see the current value.
    assert!(conn_c.try_read(&mut buf_c, 8, 0, 2, 0));
    let mut value = [0u8; 8];
    buf_c.copy_from(&mut value, 0);
    assert_eq!(u64::from_le_bytes(value), 100);

    let _conns = owner.join().unwrap();
}

#[test]
fn register_rebind_reports_prior_region() {
    let provider = LoopbackProvider::new();

    let (mut client, server) = connect_pair(&provider, |conn| conn);

    let mut buf = UniqueBuf::new();
    let mut key = 7u64;
    assert!(!client.register(&mut buf, Access::all(), &mut key).unwrap());
    assert!(buf.is_registered());
    assert_eq!(buf.key(), 7);
    assert_eq!(key, 7);

    // Same key again: the prior region is closed and replaced.
    let mut key = 7u64;
    assert!(client
        .register(&mut buf, Access::LOCAL_READ | Access::REMOTE_READ, &mut key)
        .unwrap());
    assert_eq!(key, 7);

    // A zero key asks the provider to choose one.
    let mut provider_key = 0u64;
    assert!(!client
        .register(&mut buf, Access::all(), &mut provider_key)
        .unwrap());
    assert_ne!(provider_key, 0);
    assert_eq!(buf.key(), provider_key);

    drop(server.join().unwrap());
}

#[test]
fn oversized_message_is_fatal() {
    let provider = LoopbackProvider::new();

    let (mut client, server) = connect_pair(&provider, |conn| conn);

    let mut buf = UniqueBuf::with_size(8192);
    let mut key = 0u64;
    client.register(&mut buf, Access::all(), &mut key).unwrap();

    match client.send(&buf, 5000, 0) {
        Err(Error::MessageTooLarge { size, max }) => {
            assert_eq!(size, 5000);
            assert_eq!(max, 4096);
        }
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
    // The failed send posted nothing.
    assert_eq!(client.outstanding_sends(), 0);

    drop(server.join().unwrap());
}
