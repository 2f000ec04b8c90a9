//! Listener: many virtual connections over one shared subscription.
//!
//! The accept loop reads every envelope arriving on the listener's address,
//! resolves the owning socket by demultiplexing key (correlation id, falling
//! back to the reply address) and appends the message to that socket's
//! backlog. A socket seen for the first time gets its handler spawned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::Result;
use super::handler::{spawn_supervised, SocketHandler};
use super::socket::Socket;
use crate::substrate::{Envelope, Substrate};

/// Demultiplexing table: correlation key -> live socket.
#[derive(Default)]
pub(crate) struct SocketTable {
    sockets: RwLock<HashMap<String, Socket>>,
    next_id: AtomicU64,
}

impl SocketTable {
    fn get(&self, key: &str) -> Option<Socket> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Look up `key`, creating the socket under the write lock if still absent.
    ///
    /// Returns the socket and whether it was created by this call.
    fn get_or_create<F>(&self, key: &str, create: F) -> (Socket, bool)
    where
        F: FnOnce(u64) -> Socket,
    {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sockets.get(key) {
            return (existing.clone(), false);
        }
        let socket = create(self.next_id.fetch_add(1, Ordering::Relaxed));
        sockets.insert(key.to_string(), socket.clone());
        (socket, true)
    }

    /// Remove `key` only if it still maps to the socket with `id`.
    fn remove(&self, key: &str, id: u64) {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        if sockets.get(key).is_some_and(|s| s.id() == id) {
            sockets.remove(key);
        }
    }

    fn clear(&self) {
        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Listening end of the transport.
///
/// Clones share the same subscription state, so one clone can `close()`
/// while another is blocked in `accept()`.
///
/// The subscription is a plain one, never a queue group: every message of a
/// conversation must reach the listener that owns its socket. Listeners
/// sharing an address each see the whole conversation.
#[derive(Clone)]
pub struct Listener {
    addr: String,
    substrate: Arc<dyn Substrate>,
    table: Arc<SocketTable>,
    stop: Arc<watch::Sender<bool>>,
}

impl Listener {
    pub(crate) fn new(addr: impl Into<String>, substrate: Arc<dyn Substrate>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            substrate,
            table: Arc::new(SocketTable::default()),
            stop: Arc::new(stop),
        }
    }

    /// Address this listener receives on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of sockets currently registered in the demux table.
    pub fn active_sockets(&self) -> usize {
        self.table.len()
    }

    /// Stop accepting. `accept()` unsubscribes and returns `Ok(())`.
    ///
    /// Live sockets are left alone; their handlers may finish draining.
    pub fn close(&self) {
        self.stop.send_replace(true);
        info!(addr = %self.addr, "Listener closing");
    }

    /// Run the accept loop until `close()` or the substrate ends the subscription.
    pub async fn accept<H>(&self, handler: H) -> Result<()>
    where
        H: SocketHandler,
    {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        let mut subscription = self
            .substrate
            .subscribe(&self.addr, None)
            .await?;
        let handler = Arc::new(handler);

        info!(
            addr = %self.addr,
            substrate = %self.substrate.name(),
            "Accept loop started"
        );

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                next = subscription.next() => match next {
                    Some(envelope) => self.dispatch(envelope, &handler),
                    None => {
                        warn!(addr = %self.addr, "Subscription ended by substrate");
                        break;
                    }
                }
            }
        }

        subscription.unsubscribe();
        self.table.clear();
        info!(addr = %self.addr, "Accept loop stopped");
        Ok(())
    }

    fn dispatch<H>(&self, envelope: Envelope, handler: &Arc<H>)
    where
        H: SocketHandler,
    {
        let Some(reply_to) = envelope.reply_to else {
            warn!(addr = %self.addr, "Dropping message without reply address");
            return;
        };
        let key = envelope
            .correlation_id
            .clone()
            .unwrap_or_else(|| reply_to.clone());

        let socket = match self.table.get(&key) {
            Some(socket) => socket,
            None => {
                let (socket, created) = self.table.get_or_create(&key, |id| {
                    self.new_socket(id, &key, &reply_to, envelope.correlation_id.clone())
                });
                if created {
                    debug!(key = %key, reply_to = %reply_to, "Accepted new socket");
                    spawn_supervised(Arc::clone(handler), socket.clone());
                }
                socket
            }
        };

        if !socket.deliver(envelope.message) {
            debug!(key = %key, "Dropping message for closed socket");
        }
    }

    fn new_socket(
        &self,
        id: u64,
        key: &str,
        reply_to: &str,
        correlation_id: Option<String>,
    ) -> Socket {
        let socket = Socket::new(
            id,
            key,
            self.addr.clone(),
            reply_to,
            correlation_id,
            Arc::clone(&self.substrate),
        );

        let table: Weak<SocketTable> = Arc::downgrade(&self.table);
        let owned_key = key.to_string();
        socket.set_on_close(move || {
            if let Some(table) = table.upgrade() {
                table.remove(&owned_key, id);
            }
        });
        socket
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.addr)
            .field("active_sockets", &self.active_sockets())
            .finish()
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // An error means every sender is gone, which also means stop.
    let _ = stop.wait_for(|stopped| *stopped).await;
}
