//! Virtual connection endpoint on the listening side.
//!
//! A socket owns an ordered backlog of inbound messages fed by the accept
//! loop, publishes its replies to the peer's reply address, and closes
//! exactly once no matter how many parties ask it to.
//!
//! ```text
//! accept loop ──deliver()──▶ [backlog: VecDeque] ──recv()──▶ handler
//!                                  │ notify
//! handler ──send()──▶ substrate.publish(peer reply_to)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{watch, Notify};
use tracing::debug;

use super::error::{Result, TransportError};
use crate::message::Message;
use crate::substrate::{Envelope, Substrate};

type CloseHook = Box<dyn FnOnce() + Send + Sync>;

struct SocketInner {
    id: u64,
    key: String,
    local: String,
    remote: String,
    correlation_id: Option<String>,
    substrate: Arc<dyn Substrate>,
    backlog: Mutex<VecDeque<Message>>,
    ready: Notify,
    closed: AtomicBool,
    done: watch::Sender<bool>,
    on_close: Mutex<Option<CloseHook>>,
}

/// One end of a virtual connection.
///
/// Cloning yields another handle to the same connection. Only one task
/// should call [`Socket::recv`] at a time; [`Socket::send`] may run
/// concurrently with it.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Create a socket bound to `key` that replies to `remote`.
    pub(crate) fn new(
        id: u64,
        key: impl Into<String>,
        local: impl Into<String>,
        remote: impl Into<String>,
        correlation_id: Option<String>,
        substrate: Arc<dyn Substrate>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(SocketInner {
                id,
                key: key.into(),
                local: local.into(),
                remote: remote.into(),
                correlation_id,
                substrate,
                backlog: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
                closed: AtomicBool::new(false),
                done,
                on_close: Mutex::new(None),
            }),
        }
    }

    /// Register the teardown action run by the first `close()`.
    pub(crate) fn set_on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        *lock(&self.inner.on_close) = Some(Box::new(hook));
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Correlation key demultiplexing traffic to this socket.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Address of the listener that accepted this socket.
    pub fn local(&self) -> &str {
        &self.inner.local
    }

    /// Peer's reply address.
    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of delivered messages not yet consumed.
    pub fn backlog_len(&self) -> usize {
        lock(&self.inner.backlog).len()
    }

    /// Append an inbound message to the backlog.
    ///
    /// Returns `false` if the socket is closed and the message was dropped.
    pub(crate) fn deliver(&self, message: Message) -> bool {
        {
            // The closed flag only flips under this lock, see `close()`.
            let mut backlog = lock(&self.inner.backlog);
            if self.is_closed() {
                return false;
            }
            backlog.push_back(message);
        }
        self.inner.ready.notify_one();
        true
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` once the socket is closed; messages still in the
    /// backlog at that point are discarded.
    pub async fn recv(&self) -> Result<Option<Message>> {
        loop {
            // Register interest before checking state so a concurrent
            // deliver() or close() cannot slip between check and wait.
            let notified = self.inner.ready.notified();

            if self.is_closed() {
                return Ok(None);
            }
            if let Some(message) = lock(&self.inner.backlog).pop_front() {
                return Ok(Some(message));
            }

            notified.await;
        }
    }

    /// Publish a message to the peer.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut envelope = Envelope::new(self.inner.remote.clone(), message);
        envelope.correlation_id = self.inner.correlation_id.clone();

        self.inner.substrate.publish(envelope).await?;
        Ok(())
    }

    /// Close the socket. Safe to call any number of times from any task.
    ///
    /// Pending and future `recv` calls return end-of-stream; `send` fails
    /// with `TransportError::Closed`.
    pub fn close(&self) {
        let discarded = {
            let mut backlog = lock(&self.inner.backlog);
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let n = backlog.len();
            backlog.clear();
            n
        };
        self.inner.ready.notify_waiters();
        self.inner.ready.notify_one();
        self.inner.done.send_replace(true);

        let hook = lock(&self.inner.on_close).take();
        if let Some(hook) = hook {
            hook();
        }

        debug!(key = %self.inner.key, discarded, "Socket closed");
    }

    /// Resolve once the socket has been closed.
    pub async fn closed(&self) {
        let mut done = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this only resolves on close.
        let _ = done.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("key", &self.inner.key)
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
