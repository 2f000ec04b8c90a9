//! Message substrate for connectionless delivery.
//!
//! This module contains:
//! - `Substrate` trait: publish, subscribe (optionally queue-grouped), inbox allocation
//! - `Envelope` and `Subscription`: what flows through a substrate
//! - Substrate configuration types
//! - Implementations: in-process channels, NATS

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::message::Message;

// Implementation modules
pub mod channel;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
pub use channel::ChannelSubstrate;
#[cfg(feature = "nats")]
pub use nats::NatsSubstrate;

// ============================================================================
// Traits
// ============================================================================

/// Result type for substrate operations.
pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Errors that can occur during substrate operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubstrateError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Invalid subject: '{0}'")]
    InvalidSubject(String),
}

/// A message addressed to a subject, as seen by the substrate.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Destination subject (queue name, topic, NATS subject).
    pub subject: String,
    /// Where the receiver should publish its replies.
    pub reply_to: Option<String>,
    /// Explicit correlation identifier, for substrates with a shared reply address.
    pub correlation_id: Option<String>,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub message: Message,
}

impl Envelope {
    /// Create an envelope for `subject` stamped with the current time.
    pub fn new(subject: impl Into<String>, message: Message) -> Self {
        Self {
            subject: subject.into(),
            reply_to: None,
            correlation_id: None,
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

type UnsubscribeFn = Box<dyn FnOnce() + Send + Sync>;

/// A live subscription on a substrate subject.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    on_unsubscribe: Option<UnsubscribeFn>,
}

impl Subscription {
    /// Create a subscription fed by `receiver`.
    ///
    /// `on_unsubscribe` runs exactly once, on `unsubscribe()` or drop.
    pub fn new<F>(
        subject: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Envelope>,
        on_unsubscribe: F,
    ) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            subject: subject.into(),
            receiver,
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next envelope.
    ///
    /// Returns `None` once the subscription is unsubscribed or the substrate
    /// has gone away.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Stop receiving on this subject.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.on_unsubscribe.take() {
            unsubscribe();
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Interface to a connectionless messaging system.
///
/// Implementations:
/// - `ChannelSubstrate`: In-process tokio channels
/// - `NatsSubstrate`: NATS core pub/sub
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Short name for logs and transport naming.
    fn name(&self) -> &str;

    /// Publish an envelope to `envelope.subject`.
    ///
    /// Publishing to a subject with no subscribers is not an error.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Subscribe to a subject.
    ///
    /// Subscribers sharing a `queue_group` receive each message once between
    /// them; plain subscribers each receive every message.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<Subscription>;

    /// Allocate a fresh, collision-free ephemeral address.
    fn new_inbox(&self) -> String;

    /// Whether the substrate currently believes it can publish.
    fn is_connected(&self) -> bool {
        true
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Default NATS server URL.
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// Substrate type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateType {
    /// In-process channels (no external broker).
    #[default]
    Channel,
    /// NATS core pub/sub.
    Nats,
}

/// Substrate configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    /// Substrate type discriminator.
    #[serde(rename = "type")]
    pub substrate_type: SubstrateType,
    /// NATS-specific configuration.
    pub nats: NatsConfig,
}

/// NATS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server address. A bare `host:port` gets the `nats://` scheme.
    pub url: String,
    /// Connection name reported to the server.
    pub name: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_NATS_URL.to_string(),
            name: None,
        }
    }
}

impl NatsConfig {
    /// Server URL with the scheme filled in.
    pub fn server_url(&self) -> String {
        normalize_nats_url(&self.url)
    }
}

/// Normalize a NATS server address.
///
/// - "" -> `DEFAULT_NATS_URL`
/// - "10.0.0.1:4222" -> "nats://10.0.0.1:4222"
/// - URLs that already carry a scheme are kept as-is
pub fn normalize_nats_url(addr: &str) -> String {
    let addr = addr.trim();
    if addr.is_empty() {
        return DEFAULT_NATS_URL.to_string();
    }
    if addr.contains("://") {
        return addr.to_string();
    }
    format!("nats://{}", addr)
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a substrate based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Channel: always available
/// - NATS: `--features nats`
pub async fn init_substrate(
    config: &SubstrateConfig,
) -> std::result::Result<Arc<dyn Substrate>, Box<dyn std::error::Error + Send + Sync>> {
    match config.substrate_type {
        SubstrateType::Channel => {
            info!(substrate_type = "channel", "Substrate initialized");
            Ok(Arc::new(ChannelSubstrate::new()))
        }
        SubstrateType::Nats => {
            #[cfg(feature = "nats")]
            {
                let substrate = NatsSubstrate::connect(&config.nats).await?;
                info!(substrate_type = "nats", url = %config.nats.server_url(), "Substrate initialized");
                Ok(Arc::new(substrate))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err("NATS support requires the 'nats' feature. Rebuild with --features nats".into())
            }
        }
    }
}
