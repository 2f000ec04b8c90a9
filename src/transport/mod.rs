//! Connection-oriented transport over a message substrate.
//!
//! Supports:
//! - Inbox replies: every dial subscribes to its own fresh inbox (NATS style)
//! - Shared replies: one reply address per transport, calls told apart by
//!   correlation id (RabbitMQ direct reply-to style)
//!
//! ```text
//! Client::send ──▶ publish(addr, reply_to, correlation_id)
//!                        │
//!                        ▼
//!              Listener accept loop ──demux(key)──▶ Socket backlog ──▶ handler
//!                                                                        │
//! Client::recv ◀── inbox / in-flight table ◀── publish(reply_to) ◀── Socket::send
//! ```

pub mod client;
pub mod error;
pub mod handler;
pub mod inflight;
pub mod listener;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

pub use client::Client;
pub use error::{Result, TransportError};
pub use handler::SocketHandler;
pub use inflight::InflightTable;
pub use listener::Listener;
pub use socket::Socket;

use client::ReplyChannel;
use inflight::ReplyDispatcher;

use crate::substrate::Substrate;

/// Default time a dialed client waits for its reply.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Listen addresses that ask for a generated address.
const EPHEMERAL_ADDRS: [&str; 2] = ["", ":0"];

/// How dialed clients receive their reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// One inbox subscription per dial.
    #[default]
    Inbox,
    /// One shared reply subscription plus an in-flight table.
    Shared,
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Reply routing strategy.
    pub reply_mode: ReplyMode,
    /// Milliseconds a dialed client waits for its reply.
    pub dial_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reply_mode: ReplyMode::Inbox,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TransportConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Per-dial options.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Overrides `TransportConfig::dial_timeout_ms` for this call.
    pub timeout: Option<Duration>,
}

impl DialOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-listen options.
///
/// Carries no queue group. Substrates balance queue groups per message, so a
/// conversation must stay on one plain subscription.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ListenOptions {}

/// Dial/listen contract exposed to callers.
#[async_trait]
pub trait Transport: Send + Sync {
    type Client: Send;
    type Listener: Send;

    /// Open a client connection to `addr`.
    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Self::Client>;

    /// Create a listener on `addr`. Empty or `":0"` picks a fresh address.
    async fn listen(&self, addr: &str, opts: ListenOptions) -> Result<Self::Listener>;

    fn name(&self) -> &str;
}

/// Transport over any message substrate.
pub struct BusTransport {
    substrate: Arc<dyn Substrate>,
    config: TransportConfig,
    inflight: Arc<InflightTable>,
    dispatcher: OnceCell<ReplyDispatcher>,
}

impl BusTransport {
    pub fn new(substrate: Arc<dyn Substrate>, config: TransportConfig) -> Self {
        info!(
            substrate = %substrate.name(),
            reply_mode = ?config.reply_mode,
            dial_timeout_ms = config.dial_timeout_ms,
            "Transport initialized"
        );
        Self {
            substrate,
            config,
            inflight: Arc::new(InflightTable::new()),
            dispatcher: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Number of calls waiting in the shared-reply table.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Start the shared reply subscription on first use.
    async fn reply_dispatcher(&self) -> Result<&ReplyDispatcher> {
        self.dispatcher
            .get_or_try_init(|| async {
                let inbox = self.substrate.new_inbox();
                let subscription = self.substrate.subscribe(&inbox, None).await?;
                Ok::<_, TransportError>(ReplyDispatcher::spawn(
                    subscription,
                    Arc::clone(&self.inflight),
                ))
            })
            .await
    }
}

#[async_trait]
impl Transport for BusTransport {
    type Client = Client;
    type Listener = Listener;

    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Client> {
        if addr.is_empty() {
            return Err(TransportError::InvalidArgument(
                "dial address must not be empty".to_string(),
            ));
        }
        let timeout = opts.timeout.unwrap_or_else(|| self.config.dial_timeout());
        let substrate = Arc::clone(&self.substrate);

        match self.config.reply_mode {
            ReplyMode::Inbox => {
                let inbox = self.substrate.new_inbox();
                let subscription = self.substrate.subscribe(&inbox, None).await?;
                Ok(Client::new(
                    addr,
                    inbox.clone(),
                    inbox,
                    None,
                    timeout,
                    substrate,
                    ReplyChannel::Inbox(subscription),
                ))
            }
            ReplyMode::Shared => {
                let reply_to = self.reply_dispatcher().await?.subject().to_string();
                let correlation_id = Uuid::new_v4().to_string();
                let receiver = self.inflight.register(correlation_id.clone());
                Ok(Client::new(
                    addr,
                    correlation_id.clone(),
                    reply_to,
                    Some(correlation_id),
                    timeout,
                    substrate,
                    ReplyChannel::Shared {
                        receiver,
                        table: Arc::clone(&self.inflight),
                    },
                ))
            }
        }
    }

    async fn listen(&self, addr: &str, _opts: ListenOptions) -> Result<Listener> {
        let addr = if EPHEMERAL_ADDRS.contains(&addr) {
            self.substrate.new_inbox()
        } else {
            addr.to_string()
        };
        info!(addr = %addr, "Listening");
        Ok(Listener::new(addr, Arc::clone(&self.substrate)))
    }

    fn name(&self) -> &str {
        self.substrate.name()
    }
}
