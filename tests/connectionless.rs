// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Connectionless engine scenarios: the three-way address handshake and
//! tagged application traffic, over the loopback provider.

use std::sync::mpsc;
use std::thread;

use fabric_layer::{
    Access, ConnectionlessClient, ConnectionlessServer, LoopbackProvider, ProviderKind, UniqueBuf,
    MAX_MSG_SIZE,
};

const PORT: u16 = 8080;

#[test]
fn handshake_then_send_recv() {
    let provider = LoopbackProvider::new();
    let (ready_tx, ready_rx) = mpsc::channel();

    let server_provider = provider.clone();
    let server = thread::spawn(move || {
        let mut server =
            ConnectionlessServer::new(&server_provider, "127.0.0.1", PORT, ProviderKind::Sockets)
                .unwrap();
        let mut buf = UniqueBuf::new();
        let _mr = server.register_mr(&mut buf, Access::all()).unwrap();
        ready_tx.send(()).unwrap();

        let peer = server.accept(&mut buf, MAX_MSG_SIZE).unwrap();
        buf.assign("a");
        server.send(peer, &buf, MAX_MSG_SIZE).unwrap();
    });

    ready_rx.recv().unwrap();
    let mut client =
        ConnectionlessClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    let mut buf = UniqueBuf::new();
    let _mr = client.register_mr(&mut buf, Access::all()).unwrap();

    client.connect(&mut buf, MAX_MSG_SIZE).unwrap();
    client.recv(&mut buf, MAX_MSG_SIZE).unwrap();
    assert_eq!(&buf.bytes()[..2], b"a\0");

    server.join().unwrap();
}

#[test]
fn handshake_with_async_connect_retry() {
    let provider = LoopbackProvider::new();
    let (ready_tx, ready_rx) = mpsc::channel();

    let server_provider = provider.clone();
    let server = thread::spawn(move || {
        let mut server =
            ConnectionlessServer::new(&server_provider, "127.0.0.1", PORT, ProviderKind::Sockets)
                .unwrap();
        let mut buf = UniqueBuf::new();
        let _mr = server.register_mr(&mut buf, Access::all()).unwrap();
        ready_tx.send(()).unwrap();

        server.async_accept(&mut buf, MAX_MSG_SIZE).unwrap();
        let peer = server.wait_accept(&mut buf, MAX_MSG_SIZE).unwrap();
        buf.assign("a");
        server.send(peer, &buf, MAX_MSG_SIZE).unwrap();
    });

    ready_rx.recv().unwrap();
    let mut client =
        ConnectionlessClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    let mut buf = UniqueBuf::new();
    let _mr = client.register_mr(&mut buf, Access::all()).unwrap();

    while !client.async_connect(&mut buf, MAX_MSG_SIZE) {}
    client.wait_connect().unwrap();

    client.recv(&mut buf, MAX_MSG_SIZE).unwrap();
    assert_eq!(&buf.bytes()[..2], b"a\0");

    server.join().unwrap();
}

#[test]
fn two_clients_handshake_and_receive() {
    let provider = LoopbackProvider::new();
    let (ready_tx, ready_rx) = mpsc::channel();

    let server_provider = provider.clone();
    let server = thread::spawn(move || {
        let mut server =
            ConnectionlessServer::new(&server_provider, "127.0.0.1", PORT, ProviderKind::Sockets)
                .unwrap();
        let mut buf = UniqueBuf::new();
        let _mr = server.register_mr(&mut buf, Access::all()).unwrap();
        ready_tx.send(()).unwrap();

        let first = server.accept(&mut buf, MAX_MSG_SIZE).unwrap();
        let second = server.accept(&mut buf, MAX_MSG_SIZE).unwrap();
        assert_ne!(first, second);

        buf.assign("a");
        server.send(first, &buf, MAX_MSG_SIZE).unwrap();
        server.send(second, &buf, MAX_MSG_SIZE).unwrap();
    });

    ready_rx.recv().unwrap();

    let other_provider = provider.clone();
    let other = thread::spawn(move || {
        let mut client =
            ConnectionlessClient::new(&other_provider, "127.0.0.1", PORT, ProviderKind::Sockets)
                .unwrap();
        let mut buf = UniqueBuf::new();
        let _mr = client.register_mr(&mut buf, Access::all()).unwrap();
        client.connect(&mut buf, MAX_MSG_SIZE).unwrap();
        client.recv(&mut buf, MAX_MSG_SIZE).unwrap();
        assert_eq!(&buf.bytes()[..2], b"a\0");
    });

    let mut client =
        ConnectionlessClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    let mut buf = UniqueBuf::new();
    let _mr = client.register_mr(&mut buf, Access::all()).unwrap();
    client.connect(&mut buf, MAX_MSG_SIZE).unwrap();
    client.recv(&mut buf, MAX_MSG_SIZE).unwrap();
    assert_eq!(&buf.bytes()[..2], b"a\0");

    server.join().unwrap();
    other.join().unwrap();
}

#[test]
fn local_addr_is_stable_and_unique() {
    let provider = LoopbackProvider::new();

    let server =
        ConnectionlessServer::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    let client_a =
        ConnectionlessClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    let client_b =
        ConnectionlessClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();

    assert_eq!(server.local_addr().unwrap(), b"127.0.0.1:8080".to_vec());
    assert_eq!(client_a.local_addr().unwrap(), client_a.local_addr().unwrap());
    assert_ne!(client_a.local_addr().unwrap(), client_b.local_addr().unwrap());
}
