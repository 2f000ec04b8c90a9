//! busmux-echo: Echo service over a message bus
//!
//! Listens on one address and answers each call with a copy of its request,
//! headers included.
//!
//! ## Architecture
//! ```text
//! [client] --(request, reply_to)--> [substrate] --> [busmux-echo listener]
//!    ^                                                      |
//!    +------------------(echo, reply_to)--------------------+
//! ```
//!
//! ## Configuration
//! - BUSMUX_ECHO_ADDRESS: Address to listen on (default: busmux.echo)
//! - BUSMUX_CONFIG / BUSMUX__*: Substrate and transport settings
//! - BUSMUX_LOG: Log filter (default: info)
//!
//! With the in-process channel substrate nothing else can reach the listener,
//! so the binary dials itself once to show a full round trip.

use std::sync::Arc;

use tracing::{error, info};

use busmux::config::Config;
use busmux::substrate::{init_substrate, SubstrateType};
use busmux::transport::{
    BusTransport, DialOptions, ListenOptions, Socket, Transport, TransportError,
};
use busmux::utils::bootstrap::{connect_with_retry, init_tracing, ConnectBackoff};
use busmux::Message;

const ADDRESS_ENV_VAR: &str = "BUSMUX_ECHO_ADDRESS";
const DEFAULT_ADDRESS: &str = "busmux.echo";

/// Answer one request and return; returning closes the socket and frees its key.
///
/// A dialed client sends one request per call and never signals end-of-stream.
async fn echo(socket: Socket) -> Result<(), TransportError> {
    info!(key = %socket.key(), remote = %socket.remote(), "Connection accepted");
    if let Some(message) = socket.recv().await? {
        socket.send(message).await?;
    }
    Ok(())
}

async fn dial_self(transport: Arc<BusTransport>, addr: String) -> Result<(), TransportError> {
    let mut client = transport.dial(&addr, DialOptions::default()).await?;
    client
        .send(Message::new("hello").with_header("Content-Type", "text/plain"))
        .await?;
    let reply = client.recv().await?;
    info!(
        body = %String::from_utf8_lossy(&reply.body),
        headers = reply.header.len(),
        "Echo round trip complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let addr = std::env::var(ADDRESS_ENV_VAR).unwrap_or_else(|_| DEFAULT_ADDRESS.to_string());

    let substrate_name = format!("{:?}", config.substrate.substrate_type).to_lowercase();
    let substrate = connect_with_retry(
        &substrate_name,
        &config.substrate.nats.server_url(),
        ConnectBackoff::default(),
        || init_substrate(&config.substrate),
    )
    .await
    .map_err(|e| e as Box<dyn std::error::Error>)?;

    let transport = Arc::new(BusTransport::new(substrate, config.transport.clone()));
    let listener = transport.listen(&addr, ListenOptions::default()).await?;

    let shutdown = listener.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.close();
        }
    });

    if config.substrate.substrate_type == SubstrateType::Channel {
        let transport = Arc::clone(&transport);
        let addr = listener.addr().to_string();
        tokio::spawn(async move {
            // Give the accept loop a moment to subscribe.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if let Err(e) = dial_self(transport, addr).await {
                error!(error = %e, "Self-dial failed");
            }
        });
    }

    info!(addr = %listener.addr(), substrate = %transport.name(), "busmux-echo started");
    listener.accept(echo).await?;
    info!("busmux-echo stopped");

    Ok(())
}
