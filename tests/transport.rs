//! Transport integration tests over the in-process channel substrate.
//!
//! Run with: cargo test --test transport
//!
//! Every scenario runs in both reply modes: per-dial inbox subscriptions and
//! the shared reply address with an in-flight correlation table.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use busmux::substrate::{ChannelSubstrate, SubstrateError};
use busmux::transport::{
    BusTransport, DialOptions, ListenOptions, Listener, ReplyMode, Socket, SocketHandler,
    Transport, TransportConfig, TransportError,
};
use busmux::Message;
use tokio::task::JoinHandle;

const MODES: [ReplyMode; 2] = [ReplyMode::Inbox, ReplyMode::Shared];

struct Harness {
    substrate: ChannelSubstrate,
    transport: Arc<BusTransport>,
}

impl Harness {
    fn new(mode: ReplyMode) -> Self {
        let substrate = ChannelSubstrate::new();
        let config = TransportConfig {
            reply_mode: mode,
            dial_timeout_ms: 2_000,
        };
        let transport = Arc::new(BusTransport::new(Arc::new(substrate.clone()), config));
        Self {
            substrate,
            transport,
        }
    }

    /// Listen on `addr` and run the accept loop in the background.
    ///
    /// Returns once the listener's subscription is live.
    async fn serve<H>(
        &self,
        addr: &str,
        opts: ListenOptions,
        handler: H,
    ) -> (Listener, JoinHandle<Result<(), TransportError>>)
    where
        H: SocketHandler,
    {
        let before = self.substrate.subscription_count();
        let listener = self.transport.listen(addr, opts).await.unwrap();
        let accepting = listener.clone();
        let task = tokio::spawn(async move { accepting.accept(handler).await });

        let substrate = self.substrate.clone();
        eventually("listener subscribed", || {
            substrate.subscription_count() > before
        })
        .await;
        (listener, task)
    }

    fn dial_opts(&self) -> DialOptions {
        DialOptions::default()
    }
}

async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn body(message: &Message) -> String {
    String::from_utf8(message.body.to_vec()).unwrap()
}

/// Reply once with a copy of the first message.
fn echo_once() -> impl SocketHandler {
    |socket: Socket| async move {
        if let Some(message) = socket.recv().await? {
            socket.send(message).await?;
        }
        Ok::<(), TransportError>(())
    }
}

/// Read `n` messages, then reply with their bodies joined by commas.
fn collect_then_reply(n: usize, delay: Duration) -> impl SocketHandler {
    move |socket: Socket| async move {
        tokio::time::sleep(delay).await;
        let mut bodies = Vec::with_capacity(n);
        for _ in 0..n {
            match socket.recv().await? {
                Some(message) => bodies.push(body(&message)),
                None => break,
            }
        }
        socket.send(Message::new(bodies.join(","))).await?;
        Ok::<(), TransportError>(())
    }
}

async fn for_each_mode<F, Fut>(scenario: F)
where
    F: Fn(ReplyMode) -> Fut,
    Fut: Future<Output = ()>,
{
    for mode in MODES {
        scenario(mode).await;
    }
}

// ============================================================================
// Round trip
// ============================================================================

#[tokio::test]
async fn test_round_trip_large_payload_with_headers() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let (listener, _task) = harness
            .serve("svc.echo", ListenOptions::default(), echo_once())
            .await;

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let request = Message::new(payload.clone())
            .with_header("Content-Type", "application/octet-stream")
            .with_header("X-Request-Id", "req-42");

        let mut client = harness
            .transport
            .dial(listener.addr(), harness.dial_opts())
            .await
            .unwrap();
        client.send(request).await.unwrap();
        let reply = client.recv().await.unwrap();

        assert_eq!(&reply.body[..], &payload[..], "mode {:?}", mode);
        assert_eq!(
            reply.header.get("Content-Type"),
            Some("application/octet-stream")
        );
        assert_eq!(reply.header.get("X-Request-Id"), Some("req-42"));
        listener.close();
    })
    .await;
}

// ============================================================================
// Ordering and backlog
// ============================================================================

#[tokio::test]
async fn test_messages_on_one_key_arrive_in_order() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let (listener, _task) = harness
            .serve(
                "svc.order",
                ListenOptions::default(),
                collect_then_reply(200, Duration::ZERO),
            )
            .await;

        let mut client = harness
            .transport
            .dial("svc.order", harness.dial_opts())
            .await
            .unwrap();
        for i in 0..200 {
            client.send(Message::new(i.to_string())).await.unwrap();
        }

        let reply = client.recv().await.unwrap();
        let expected: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        assert_eq!(body(&reply), expected.join(","), "mode {:?}", mode);
        listener.close();
    })
    .await;
}

#[tokio::test]
async fn test_backlog_survives_slow_consumer() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let (listener, _task) = harness
            .serve(
                "svc.backlog",
                ListenOptions::default(),
                collect_then_reply(25, Duration::from_millis(100)),
            )
            .await;

        let mut client = harness
            .transport
            .dial("svc.backlog", harness.dial_opts())
            .await
            .unwrap();
        for i in 0..25 {
            client.send(Message::new(format!("m{}", i))).await.unwrap();
        }

        let reply = client.recv().await.unwrap();
        let expected: Vec<String> = (0..25).map(|i| format!("m{}", i)).collect();
        assert_eq!(body(&reply), expected.join(","), "mode {:?}", mode);
        listener.close();
    })
    .await;
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
async fn test_concurrent_clients_are_isolated() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let (listener, _task) = harness
            .serve(
                "svc.isolate",
                ListenOptions::default(),
                collect_then_reply(10, Duration::ZERO),
            )
            .await;

        let calls = (0..16).map(|client_id| {
            let transport = Arc::clone(&harness.transport);
            async move {
                let mut client = transport
                    .dial("svc.isolate", DialOptions::default())
                    .await
                    .unwrap();
                for seq in 0..10 {
                    client
                        .send(Message::new(format!("c{}-{}", client_id, seq)))
                        .await
                        .unwrap();
                    if seq % 3 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                (client_id, body(&client.recv().await.unwrap()))
            }
        });

        for (client_id, reply) in futures::future::join_all(calls).await {
            let expected: Vec<String> = (0..10).map(|seq| format!("c{}-{}", client_id, seq)).collect();
            assert_eq!(reply, expected.join(","), "mode {:?}", mode);
        }
        listener.close();
    })
    .await;
}

// ============================================================================
// Timeout
// ============================================================================

#[tokio::test]
async fn test_recv_times_out_without_reply() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let mut client = harness
            .transport
            .dial(
                "svc.nobody",
                DialOptions::default().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        client.send(Message::new("anyone?")).await.unwrap();

        let started = Instant::now();
        let err = client.recv().await.unwrap_err();
        assert!(err.is_timeout(), "mode {:?}: {}", mode, err);
        assert!(started.elapsed() < Duration::from_secs(1));

        // The key is still held after a timeout; close gives it back.
        client.close();
        assert_eq!(harness.transport.inflight_len(), 0);
        assert_eq!(harness.substrate.subscription_count(), baseline(mode));
    })
    .await;
}

/// Subscriptions the transport itself holds with no call in flight.
fn baseline(mode: ReplyMode) -> usize {
    match mode {
        ReplyMode::Inbox => 0,
        // The shared reply subscription lives as long as the transport.
        ReplyMode::Shared => 1,
    }
}

// ============================================================================
// Leak-free key reuse
// ============================================================================

#[tokio::test]
async fn test_dial_close_cycles_do_not_leak() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let (listener, _task) = harness
            .serve("svc.cycle", ListenOptions::default(), echo_once())
            .await;

        for i in 0..50 {
            let mut client = harness
                .transport
                .dial("svc.cycle", harness.dial_opts())
                .await
                .unwrap();
            client.send(Message::new(i.to_string())).await.unwrap();
            assert_eq!(body(&client.recv().await.unwrap()), i.to_string());
            client.close();

            assert_eq!(harness.transport.inflight_len(), 0, "mode {:?}", mode);
            // Listener subscription plus whatever the transport keeps.
            assert_eq!(
                harness.substrate.subscription_count(),
                baseline(mode) + 1,
                "mode {:?}",
                mode
            );
            let sockets = listener.clone();
            eventually("socket table drained", || sockets.active_sockets() == 0).await;
        }
        listener.close();
    })
    .await;
}

#[tokio::test]
async fn test_abandoned_clients_release_on_drop() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        for _ in 0..20 {
            let client = harness
                .transport
                .dial("svc.abandoned", harness.dial_opts())
                .await
                .unwrap();
            drop(client);
        }
        assert_eq!(harness.transport.inflight_len(), 0);
        assert_eq!(harness.substrate.subscription_count(), baseline(mode));
    })
    .await;
}

// ============================================================================
// Reply semantics
// ============================================================================

#[tokio::test]
async fn test_second_reply_is_dropped() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let handler = |socket: Socket| async move {
            if socket.recv().await?.is_some() {
                socket.send(Message::new("first")).await?;
                socket.send(Message::new("second")).await?;
            }
            Ok::<(), TransportError>(())
        };
        let (listener, _task) = harness
            .serve("svc.twice", ListenOptions::default(), handler)
            .await;

        let mut client = harness
            .transport
            .dial("svc.twice", harness.dial_opts())
            .await
            .unwrap();
        client.send(Message::new("req")).await.unwrap();

        assert_eq!(body(&client.recv().await.unwrap()), "first");
        assert!(matches!(client.recv().await, Err(TransportError::Closed)));
        assert_eq!(harness.transport.inflight_len(), 0);
        listener.close();
    })
    .await;
}

#[tokio::test]
async fn test_send_fails_fast_when_substrate_disconnected() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let client = harness
            .transport
            .dial("svc.down", harness.dial_opts())
            .await
            .unwrap();
        harness.substrate.set_connected(false);

        let err = client.send(Message::new("req")).await.unwrap_err();
        assert!(
            matches!(err, TransportError::Substrate(SubstrateError::NotConnected(_))),
            "mode {:?}: {}",
            mode,
            err
        );
    })
    .await;
}

// ============================================================================
// Failure isolation and lifecycle
// ============================================================================

#[tokio::test]
async fn test_handler_panic_does_not_stop_listener() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let handler = |socket: Socket| async move {
            if let Some(message) = socket.recv().await? {
                if &message.body[..] == b"boom" {
                    panic!("handler blew up");
                }
                socket.send(message).await?;
            }
            Ok::<(), TransportError>(())
        };
        let (listener, task) = harness
            .serve("svc.panic", ListenOptions::default(), handler)
            .await;

        let mut doomed = harness
            .transport
            .dial(
                "svc.panic",
                DialOptions::default().with_timeout(Duration::from_millis(150)),
            )
            .await
            .unwrap();
        doomed.send(Message::new("boom")).await.unwrap();
        assert!(doomed.recv().await.unwrap_err().is_timeout());

        let mut healthy = harness
            .transport
            .dial("svc.panic", harness.dial_opts())
            .await
            .unwrap();
        healthy.send(Message::new("fine")).await.unwrap();
        assert_eq!(body(&healthy.recv().await.unwrap()), "fine", "mode {:?}", mode);

        assert!(!task.is_finished());
        listener.close();
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_socket_close_tears_down_once() {
    for_each_mode(|mode| async move {
        let harness = Harness::new(mode);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let handler = move |socket: Socket| {
            let counter = Arc::clone(&counter);
            async move {
                socket.recv().await?;
                let closers: Vec<_> = (0..16)
                    .map(|_| {
                        let socket = socket.clone();
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            socket.close();
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                    })
                    .collect();
                for closer in closers {
                    closer.await.map_err(|e| TransportError::Handler(e.to_string()))?;
                }
                assert!(matches!(socket.recv().await, Ok(None)));
                Ok::<(), TransportError>(())
            }
        };
        let (listener, _task) = harness
            .serve("svc.close", ListenOptions::default(), handler)
            .await;

        let client = harness
            .transport
            .dial("svc.close", harness.dial_opts())
            .await
            .unwrap();
        client.send(Message::new("hi")).await.unwrap();

        let sockets = listener.clone();
        eventually("socket removed", || sockets.active_sockets() == 0).await;
        let done = Arc::clone(&closes);
        eventually("all closers returned", || done.load(Ordering::SeqCst) == 16).await;
        listener.close();
    })
    .await;
}

#[tokio::test]
async fn test_listener_close_ends_accept_and_unsubscribes() {
    let harness = Harness::new(ReplyMode::Inbox);
    let (listener, task) = harness
        .serve("svc.stop", ListenOptions::default(), echo_once())
        .await;
    assert_eq!(harness.substrate.subscription_count(), 1);

    listener.close();
    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("accept loop should stop")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(harness.substrate.subscription_count(), 0);
}

#[tokio::test]
async fn test_listeners_sharing_address_each_see_whole_conversation() {
    let harness = Harness::new(ReplyMode::Shared);
    let served: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut listeners = Vec::new();
    for member in 0..2 {
        let served = Arc::clone(&served);
        let handler = move |socket: Socket| {
            let served = Arc::clone(&served);
            async move {
                let mut bodies = Vec::new();
                for _ in 0..4 {
                    match socket.recv().await? {
                        Some(message) => bodies.push(body(&message)),
                        None => break,
                    }
                }
                let joined = bodies.join(",");
                served.lock().unwrap().push((member, joined.clone()));
                socket.send(Message::new(joined)).await?;
                Ok::<(), TransportError>(())
            }
        };
        let (listener, _task) = harness
            .serve("svc.shared", ListenOptions::default(), handler)
            .await;
        listeners.push(listener);
    }

    let mut client = harness
        .transport
        .dial("svc.shared", harness.dial_opts())
        .await
        .unwrap();
    for i in 0..4 {
        client.send(Message::new(i.to_string())).await.unwrap();
    }
    assert_eq!(body(&client.recv().await.unwrap()), "0,1,2,3");

    let served_ref = Arc::clone(&served);
    eventually("both listeners served", || served_ref.lock().unwrap().len() == 2).await;
    let mut served = served.lock().unwrap().clone();
    served.sort();
    assert_eq!(
        served,
        vec![(0, "0,1,2,3".to_string()), (1, "0,1,2,3".to_string())]
    );
    for listener in listeners {
        listener.close();
    }
}
