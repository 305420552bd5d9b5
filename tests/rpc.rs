// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! RPC layer scenarios over the loopback provider.

use std::sync::mpsc;
use std::thread;

use fabric_layer::rpc::{RpcCaller, RpcClient, RpcServer, RpcService, SHUTDOWN_FN_ID};
use fabric_layer::{Error, LoopbackProvider, ProviderKind, MAX_MSG_SIZE};

const PORT: u16 = 8080;
const ECHO_FN_ID: u64 = 1;

fn spawn_echo_server(
    provider: &LoopbackProvider,
) -> thread::JoinHandle<fabric_layer::Result<()>> {
    let provider = provider.clone();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut server = RpcServer::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets)?;
        server.register_rpc(ECHO_FN_ID, Box::new(|arg| arg.to_vec()));
        ready_tx.send(()).expect("test thread is waiting");
        server.start()
    });
    ready_rx.recv().unwrap();
    handle
}

#[test]
fn echo_ten_times_then_shutdown() {
    let provider = LoopbackProvider::new();
    let server = spawn_echo_server(&provider);

    let mut client = RpcClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    for _ in 0..10 {
        let reply = client.call_remote(ECHO_FN_ID, b"hi").unwrap();
        assert_eq!(reply, b"hi");
    }

    // The shutdown function echoes its argument and stops the serve loop.
    let reply = client.call_remote(SHUTDOWN_FN_ID, b"bye").unwrap();
    assert_eq!(reply, b"bye");

    server.join().unwrap().unwrap();
}

#[test]
fn large_arguments_round_trip() {
    let provider = LoopbackProvider::new();
    let server = spawn_echo_server(&provider);

    let mut client = RpcClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    let arg: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    assert_eq!(client.call_remote(ECHO_FN_ID, &arg).unwrap(), arg);

    client.call_remote(SHUTDOWN_FN_ID, b"").unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn unknown_function_id_stops_the_server() {
    let provider = LoopbackProvider::new();

    let (ready_tx, ready_rx) = mpsc::channel();
    let server_provider = provider.clone();
    let server = thread::spawn(move || {
        let mut server =
            RpcServer::new(&server_provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
        ready_tx.send(()).unwrap();
        server.start()
    });
    ready_rx.recv().unwrap();

    // The caller never gets a reply, so it must not wait for one; leave the
    // call running on its own thread.
    let caller_provider = provider.clone();
    thread::spawn(move || {
        let mut client =
            RpcClient::new(&caller_provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
        let _ = client.call_remote(99, b"nobody home");
    });

    match server.join().unwrap() {
        Err(Error::HandlerMissing(99)) => {}
        other => panic!("expected HandlerMissing(99), got {other:?}"),
    }
}

#[test]
#[should_panic(expected = "duplicate rpc function id")]
fn duplicate_registration_panics() {
    let provider = LoopbackProvider::new();
    let mut server = RpcServer::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();
    // Id 0 is pre-registered as the shutdown function.
    server.register_rpc(SHUTDOWN_FN_ID, Box::new(|arg| arg.to_vec()));
}

#[test]
fn oversized_argument_is_rejected_before_posting() {
    let provider = LoopbackProvider::new();
    let mut client = RpcClient::new(&provider, "127.0.0.1", PORT, ProviderKind::Sockets).unwrap();

    let arg = vec![0u8; MAX_MSG_SIZE];
    match client.call_remote(ECHO_FN_ID, &arg) {
        Err(Error::MessageTooLarge { .. }) => {}
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
}
