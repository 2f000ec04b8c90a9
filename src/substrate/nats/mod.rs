//! NATS core substrate implementation.
//!
//! Maps the substrate contract onto plain NATS subjects:
//! - `publish` -> `publish_with_reply_and_headers` (reply subject is native)
//! - `subscribe` -> `subscribe` / `queue_subscribe`
//! - `new_inbox` -> the client's inbox generator
//!
//! NATS has no correlation-id field, so it travels in a reserved header,
//! together with the publish timestamp. Both are stripped again on receipt.

use async_nats::{HeaderMap, ToSubject};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{Envelope, NatsConfig, Result, Substrate, SubstrateError, Subscription};
use crate::message::{AttributeValue, HeaderError, Headers, Message};

/// Header carrying the correlation id.
pub const CORRELATION_HEADER: &str = "Busmux-Correlation-Id";
/// Header carrying the publish timestamp (RFC 3339).
pub const TIMESTAMP_HEADER: &str = "Busmux-Timestamp";

const SUBSTRATE_NAME: &str = "nats";

/// Substrate backed by a NATS connection.
#[derive(Clone)]
pub struct NatsSubstrate {
    client: async_nats::Client,
}

impl NatsSubstrate {
    /// Connect using the given configuration.
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let url = config.server_url();
        let mut options = async_nats::ConnectOptions::new();
        if let Some(name) = &config.name {
            options = options.name(name);
        }
        let client = options
            .connect(&url)
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        info!(url = %url, "Connected to NATS");
        Ok(Self { client })
    }

    /// Wrap an already-connected client.
    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }

    fn encode_headers(envelope: &Envelope) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in &envelope.message.header {
            headers.insert(key.as_str(), value.as_str());
        }
        if let Some(correlation_id) = &envelope.correlation_id {
            headers.insert(CORRELATION_HEADER, correlation_id.as_str());
        }
        headers.insert(TIMESTAMP_HEADER, envelope.timestamp.to_rfc3339().as_str());
        headers
    }
}

/// Separator for header fields that carry several values.
const MULTI_VALUE_SEPARATOR: &str = ", ";

/// Flatten a NATS header map. Repeated fields are joined in arrival order.
fn decode_headers(map: &HeaderMap) -> std::result::Result<Headers, HeaderError> {
    Headers::try_from_attributes(map.iter().map(|(name, values)| {
        let joined = values
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(MULTI_VALUE_SEPARATOR);
        (name.to_string(), AttributeValue::Text(joined))
    }))
}

/// Convert a received NATS message into an envelope.
fn decode_message(msg: async_nats::Message) -> std::result::Result<Envelope, HeaderError> {
    let mut headers = match &msg.headers {
        Some(map) => decode_headers(map)?,
        None => Headers::new(),
    };

    let timestamp = headers
        .parse::<DateTime<Utc>>(TIMESTAMP_HEADER)?
        .unwrap_or_else(Utc::now);
    headers.remove(TIMESTAMP_HEADER);
    let correlation_id = headers.remove(CORRELATION_HEADER);

    Ok(Envelope {
        subject: msg.subject.to_string(),
        reply_to: msg.reply.map(|r| r.to_string()),
        correlation_id,
        timestamp,
        message: Message {
            header: headers,
            body: msg.payload,
        },
    })
}

#[async_trait]
impl Substrate for NatsSubstrate {
    fn name(&self) -> &str {
        SUBSTRATE_NAME
    }

    #[tracing::instrument(name = "substrate.publish", skip_all, fields(subject = %envelope.subject))]
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if envelope.subject.is_empty() {
            return Err(SubstrateError::InvalidSubject(envelope.subject));
        }

        let headers = Self::encode_headers(&envelope);
        let payload: Bytes = envelope.message.body;
        let subject = envelope.subject.to_subject();

        let published = match envelope.reply_to {
            Some(reply) => {
                self.client
                    .publish_with_reply_and_headers(subject, reply, headers, payload)
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(subject, headers, payload)
                    .await
            }
        };
        published.map_err(|e| SubstrateError::Publish(e.to_string()))?;

        debug!("Published envelope to NATS");
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<Subscription> {
        if subject.is_empty() {
            return Err(SubstrateError::InvalidSubject(subject.to_string()));
        }

        let owned_subject = subject.to_string();
        let mut subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(owned_subject.clone(), group.to_string())
                    .await
            }
            None => self.client.subscribe(owned_subject.clone()).await,
        }
        .map_err(|e| SubstrateError::Subscribe(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task_subject = owned_subject.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        if let Err(e) = subscriber.unsubscribe().await {
                            warn!(subject = %task_subject, error = %e, "NATS unsubscribe failed");
                        }
                        break;
                    }
                    next = subscriber.next() => match next {
                        Some(msg) => match decode_message(msg) {
                            Ok(envelope) => {
                                if sender.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(subject = %task_subject, error = %e, "Dropping NATS message with unreadable headers");
                            }
                        },
                        None => {
                            debug!(subject = %task_subject, "NATS subscription ended");
                            break;
                        }
                    }
                }
            }
        });

        debug!(subject = %owned_subject, queue_group = ?queue_group, "Subscribed to NATS subject");

        Ok(Subscription::new(owned_subject, receiver, move || {
            let _ = stop_tx.send(());
        }))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}
