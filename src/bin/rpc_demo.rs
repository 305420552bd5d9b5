// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Run an RPC server and client over the loopback provider: call an echo
//! function a few times, then shut the server down.

use std::sync::mpsc;
use std::thread;

use clap::Parser;

use fabric_layer::rpc::{RpcCaller, RpcClient, RpcServer, RpcService, SHUTDOWN_FN_ID};
use fabric_layer::{LoopbackProvider, ProviderKind, DEFAULT_PORT};

const ECHO_FN_ID: u64 = 1;

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of echo calls to make before shutting down.
    #[arg(long, default_value_t = 10)]
    calls: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let provider = LoopbackProvider::new();

    let server_provider = provider.clone();
    let port = args.port;
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = thread::spawn(move || -> fabric_layer::Result<()> {
        let mut server = RpcServer::new(&server_provider, "localhost", port, ProviderKind::Sockets)?;
        server.register_rpc(ECHO_FN_ID, Box::new(|arg| arg.to_vec()));
        ready_tx.send(()).expect("main thread is waiting");
        server.start()
    });
    ready_rx.recv()?;

    let mut client = RpcClient::new(&provider, "localhost", args.port, ProviderKind::Sockets)?;
    for i in 0..args.calls {
        let message = format!("echo {i}");
        let reply = client.call_remote(ECHO_FN_ID, message.as_bytes())?;
        println!("{} -> {}", message, String::from_utf8_lossy(&reply));
    }

    client.call_remote(SHUTDOWN_FN_ID, b"")?;
    server.join().expect("server thread panicked")?;
    println!("server shut down cleanly");

    Ok(())
}
