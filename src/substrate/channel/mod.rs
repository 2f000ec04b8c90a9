//! In-memory channel-based substrate for standalone mode.
//!
//! Uses tokio unbounded channels for pub/sub within a single process.
//! Ideal for local development and testing without external dependencies.
//! Like a real broker it keeps no connection state: publishing to a subject
//! nobody listens on silently drops the message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Envelope, Result, Substrate, SubstrateError, Subscription};

/// Prefix of addresses handed out by `new_inbox`.
pub const INBOX_PREFIX: &str = "_INBOX.";

const SUBSTRATE_NAME: &str = "channel";

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Envelope>,
}

/// Subscribers sharing one queue group; each message goes to one member.
#[derive(Default)]
struct QueueGroup {
    members: Vec<Subscriber>,
    cursor: usize,
}

impl QueueGroup {
    /// Deliver to the next live member, pruning members whose receiver is gone.
    fn deliver(&mut self, envelope: &Envelope) -> bool {
        while !self.members.is_empty() {
            let idx = self.cursor % self.members.len();
            if self.members[idx].sender.send(envelope.clone()).is_ok() {
                self.cursor = idx + 1;
                return true;
            }
            self.members.remove(idx);
        }
        false
    }
}

#[derive(Default)]
struct SubjectSubscribers {
    plain: Vec<Subscriber>,
    groups: HashMap<String, QueueGroup>,
}

impl SubjectSubscribers {
    fn len(&self) -> usize {
        self.plain.len() + self.groups.values().map(|g| g.members.len()).sum::<usize>()
    }

    fn remove(&mut self, id: u64, group: Option<&str>) {
        match group {
            None => self.plain.retain(|s| s.id != id),
            Some(name) => {
                if let Some(queue) = self.groups.get_mut(name) {
                    queue.members.retain(|s| s.id != id);
                    if queue.members.is_empty() {
                        self.groups.remove(name);
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    subjects: Mutex<HashMap<String, SubjectSubscribers>>,
    next_id: AtomicU64,
    published: AtomicU64,
    disconnected: AtomicBool,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SubjectSubscribers>> {
        self.subjects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, subject: &str, id: u64, group: Option<&str>) {
        let mut subjects = self.lock();
        if let Some(entry) = subjects.get_mut(subject) {
            entry.remove(id, group);
            if entry.len() == 0 {
                subjects.remove(subject);
            }
        }
        debug!(subject = %subject, "Unsubscribed from channel substrate");
    }
}

/// In-memory substrate using tokio channels.
///
/// Clones share the same subject registry, so a publisher and any number of
/// listeners can be handed separate clones.
#[derive(Clone, Default)]
pub struct ChannelSubstrate {
    registry: Arc<Registry>,
}

impl ChannelSubstrate {
    /// Create a new channel substrate.
    pub fn new() -> Self {
        info!("Channel substrate initialized");
        Self::default()
    }

    /// Number of live subscriptions across all subjects.
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().values().map(SubjectSubscribers::len).sum()
    }

    /// Number of successful publish calls.
    pub fn published_count(&self) -> u64 {
        self.registry.published.load(Ordering::SeqCst)
    }

    /// Simulate the broker going away (or coming back).
    ///
    /// While disconnected, `publish` fails with `SubstrateError::NotConnected`.
    pub fn set_connected(&self, connected: bool) {
        self.registry.disconnected.store(!connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Substrate for ChannelSubstrate {
    fn name(&self) -> &str {
        SUBSTRATE_NAME
    }

    #[tracing::instrument(name = "substrate.publish", skip_all, fields(subject = %envelope.subject))]
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if !self.is_connected() {
            return Err(SubstrateError::NotConnected(SUBSTRATE_NAME.to_string()));
        }
        if envelope.subject.is_empty() {
            return Err(SubstrateError::InvalidSubject(envelope.subject));
        }

        let mut subjects = self.registry.lock();
        self.registry.published.fetch_add(1, Ordering::SeqCst);

        let Some(entry) = subjects.get_mut(&envelope.subject) else {
            debug!("Published envelope (no subscribers)");
            return Ok(());
        };

        let mut receivers = 0usize;
        entry.plain.retain(|s| {
            let alive = s.sender.send(envelope.clone()).is_ok();
            receivers += usize::from(alive);
            alive
        });
        entry.groups.retain(|_, group| {
            receivers += usize::from(group.deliver(&envelope));
            !group.members.is_empty()
        });

        if entry.len() == 0 {
            subjects.remove(&envelope.subject);
        }

        debug!(receivers, "Published envelope to channel");
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<Subscription> {
        if subject.is_empty() {
            return Err(SubstrateError::InvalidSubject(subject.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut subjects = self.registry.lock();
            let entry = subjects.entry(subject.to_string()).or_default();
            let subscriber = Subscriber { id, sender };
            match queue_group {
                None => entry.plain.push(subscriber),
                Some(group) => entry
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .members
                    .push(subscriber),
            }
        }

        debug!(subject = %subject, queue_group = ?queue_group, "Subscribed to channel substrate");

        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        let owned_subject = subject.to_string();
        let owned_group = queue_group.map(str::to_string);
        Ok(Subscription::new(subject, receiver, move || {
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(&owned_subject, id, owned_group.as_deref());
            }
        }))
    }

    fn new_inbox(&self) -> String {
        format!("{}{}", INBOX_PREFIX, Uuid::new_v4().simple())
    }

    fn is_connected(&self) -> bool {
        !self.registry.disconnected.load(Ordering::SeqCst)
    }
}
