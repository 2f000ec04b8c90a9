//! Dial side: one request, one reply, over a correlation key.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::error::{Result, TransportError};
use super::inflight::InflightTable;
use crate::message::Message;
use crate::substrate::{Envelope, Substrate, SubstrateError, Subscription};

/// Where the single reply for a call will show up.
pub(crate) enum ReplyChannel {
    /// Dedicated inbox subscription (pure pub/sub substrates).
    Inbox(Subscription),
    /// Slot in the transport's in-flight table, fed by the reply dispatcher.
    Shared {
        receiver: mpsc::Receiver<Envelope>,
        table: Arc<InflightTable>,
    },
    /// Key already given back.
    Released,
}

/// Client end of a virtual connection.
///
/// Holds one correlation key from `dial` until the reply is received or the
/// client is closed or dropped, whichever comes first.
pub struct Client {
    addr: String,
    key: String,
    reply_to: String,
    correlation_id: Option<String>,
    timeout: Duration,
    substrate: Arc<dyn Substrate>,
    reply: ReplyChannel,
}

impl Client {
    pub(crate) fn new(
        addr: impl Into<String>,
        key: impl Into<String>,
        reply_to: impl Into<String>,
        correlation_id: Option<String>,
        timeout: Duration,
        substrate: Arc<dyn Substrate>,
        reply: ReplyChannel,
    ) -> Self {
        Self {
            addr: addr.into(),
            key: key.into(),
            reply_to: reply_to.into(),
            correlation_id,
            timeout,
            substrate,
            reply,
        }
    }

    /// Correlation key the listener will demultiplex this call by.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Address dialed.
    pub fn remote(&self) -> &str {
        &self.addr
    }

    /// How long `recv` waits for the reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.reply, ReplyChannel::Released)
    }

    /// Publish a request to the dialed address.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.substrate.is_connected() {
            return Err(SubstrateError::NotConnected(self.substrate.name().to_string()).into());
        }

        let mut envelope =
            Envelope::new(self.addr.clone(), message).with_reply_to(self.reply_to.clone());
        envelope.correlation_id = self.correlation_id.clone();

        self.substrate.publish(envelope).await?;
        Ok(())
    }

    /// Wait for the reply.
    ///
    /// Fails with `TransportError::Timeout` if nothing arrives in time; the
    /// key stays registered so the caller can still close cleanly. After the
    /// reply is returned the key is released and further calls fail with
    /// `TransportError::Closed`.
    pub async fn recv(&mut self) -> Result<Message> {
        let deadline = self.timeout;
        let received = match &mut self.reply {
            ReplyChannel::Released => return Err(TransportError::Closed),
            ReplyChannel::Inbox(subscription) => {
                tokio::time::timeout(deadline, subscription.next()).await
            }
            ReplyChannel::Shared { receiver, .. } => {
                tokio::time::timeout(deadline, receiver.recv()).await
            }
        };

        match received {
            Err(_) => {
                debug!(key = %self.key, timeout = ?deadline, "Timed out waiting for reply");
                Err(TransportError::Timeout(deadline))
            }
            Ok(None) => {
                self.release();
                Err(TransportError::Closed)
            }
            Ok(Some(envelope)) => {
                self.release();
                Ok(envelope.message)
            }
        }
    }

    /// Release the correlation key. Idempotent.
    pub fn close(&mut self) {
        self.release();
    }

    fn release(&mut self) {
        match std::mem::replace(&mut self.reply, ReplyChannel::Released) {
            ReplyChannel::Inbox(subscription) => subscription.unsubscribe(),
            ReplyChannel::Shared { table, .. } => table.release(&self.key),
            ReplyChannel::Released => return,
        }
        debug!(key = %self.key, "Client released correlation key");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}
