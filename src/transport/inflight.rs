//! Correlation table for dial-side replies on a shared reply address.
//!
//! Substrates like RabbitMQ's direct reply-to deliver every reply for a
//! process to one address. Each outstanding call registers its correlation id
//! here; a dispatcher task reading the shared reply subscription routes every
//! reply into the matching call's single-slot channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::substrate::{Envelope, Subscription};

/// In-flight calls keyed by correlation id.
///
/// Owned by one transport instance; never shared between transports.
#[derive(Default)]
pub struct InflightTable {
    pending: Mutex<HashMap<String, mpsc::Sender<Envelope>>>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<Envelope>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call and return the receiver its single reply lands in.
    pub fn register(&self, correlation_id: impl Into<String>) -> mpsc::Receiver<Envelope> {
        let (sender, receiver) = mpsc::channel(1);
        self.lock().insert(correlation_id.into(), sender);
        receiver
    }

    /// Route a reply to its caller.
    ///
    /// Returns `false` if the reply was dropped: no correlation id, nobody
    /// waiting for it, or a reply is already queued for that call.
    pub fn complete(&self, envelope: Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id.as_deref() else {
            debug!("Dropping reply without correlation id");
            return false;
        };

        let sender = match self.lock().get(correlation_id) {
            Some(sender) => sender.clone(),
            None => {
                debug!(correlation_id = %correlation_id, "Dropping reply for unknown call");
                return false;
            }
        };

        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(_) => {
                debug!("Dropping duplicate reply");
                false
            }
        }
    }

    /// Forget a call. Late replies for it will be dropped.
    pub fn release(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background task feeding the shared reply subscription into the table.
pub(crate) struct ReplyDispatcher {
    subject: String,
    task: JoinHandle<()>,
}

impl ReplyDispatcher {
    pub(crate) fn spawn(mut subscription: Subscription, table: Arc<InflightTable>) -> Self {
        let subject = subscription.subject().to_string();
        info!(subject = %subject, "Reply dispatcher started");

        let task = tokio::spawn(async move {
            while let Some(envelope) = subscription.next().await {
                table.complete(envelope);
            }
            debug!(subject = %subscription.subject(), "Reply subscription ended");
        });

        Self { subject, task }
    }

    /// Shared reply address advertised in outgoing requests.
    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for ReplyDispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
