// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Resolve fabric info and print what the provider offers.

use clap::Parser;

use fabric_layer::fabric::{Caps, Hints, Provider};
use fabric_layer::{LoopbackProvider, ProviderKind, DEFAULT_PORT};

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value = "localhost")]
    node: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Ask for the verbs provider instead of sockets.
    #[arg(long)]
    verbs: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let kind = if args.verbs {
        ProviderKind::Verbs
    } else {
        ProviderKind::Sockets
    };
    let provider = LoopbackProvider::new();

    for (label, hints) in [
        ("msg", Hints::msg(kind)),
        (
            "rdm",
            Hints::rdm(kind, Caps::MSG | Caps::TAGGED | Caps::DIRECTED_RECV),
        ),
    ] {
        let info = provider.get_info(Some(args.node.as_str()), &args.port.to_string(), true, &hints)?;
        println!("{label}: {}", info.fabric_name);
        println!("  caps: {}", info.caps);
        println!("  tx/rx queue depth: {}/{}", info.tx_size, info.rx_size);
    }

    Ok(())
}
