//! Relay daemon: one UDP port, no configuration file. The port can be
//! given as the sole argument (default 5004); a bind failure exits
//! non-zero.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quicr_relay::{Relay, RelayConfig};
use quicr_transport::transport::UdpTransport;

const DEFAULT_PORT: u16 = 5004;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<u16>()
            .with_context(|| format!("invalid port {arg:?}"))?,
        None => DEFAULT_PORT,
    };

    let transport =
        Arc::new(UdpTransport::bind(("0.0.0.0", port)).context("relay bind failed")?);
    info!(port, "relay listening");

    let mut relay = Relay::new(transport, RelayConfig::default());
    loop {
        // process() polls the socket with a short timeout, so this loop
        // idles at roughly 1 ms granularity without spinning.
        relay.process();
    }
}
