//! Socket handler contract and the per-socket supervision boundary.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use super::error::Result;
use super::socket::Socket;

/// Handler invoked once per new virtual connection.
///
/// Implemented for any `Fn(Socket) -> impl Future<Output = Result<()>>`, so
/// async closures can be passed to `Listener::accept` directly.
pub trait SocketHandler: Send + Sync + 'static {
    /// Serve one socket until the conversation is over.
    fn handle(&self, socket: Socket) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> SocketHandler for F
where
    F: Fn(Socket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, socket: Socket) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(socket))
    }
}

/// Run `handler` for `socket` in its own task and close the socket when it ends.
///
/// A handler that returns an error or panics only loses its own socket; the
/// panic is observed through the join handle and never reaches the accept loop.
pub(crate) fn spawn_supervised<H>(handler: Arc<H>, socket: Socket)
where
    H: SocketHandler + ?Sized,
{
    let worker_socket = socket.clone();
    let task = tokio::spawn(async move { handler.handle(worker_socket).await });

    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => {
                debug!(key = %socket.key(), "Socket handler finished");
            }
            Ok(Err(e)) => {
                warn!(key = %socket.key(), error = %e, "Socket handler failed");
            }
            Err(e) if e.is_panic() => {
                error!(key = %socket.key(), "Socket handler panicked, closing socket");
            }
            Err(e) => {
                warn!(key = %socket.key(), error = %e, "Socket handler cancelled");
            }
        }
        socket.close();
    });
}
