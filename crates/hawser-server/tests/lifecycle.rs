//! End-to-end connection lifecycle over real sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use hawser_core::{
    DefaultMessageFactory, LengthPrefixed, Message, MessageId, MessagePool, WireFormat,
};
use hawser_server::{
    ClientSession, ConnectionFactory, HandlerRegistry, Listener, ListenerConfig, OutboundMessage,
    Server, SessionWiring, ShutdownInitiator,
};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

#[derive(Default)]
struct CountingServer {
    sessions: Mutex<Vec<Arc<ClientSession>>>,
    adds: AtomicUsize,
    removes: AtomicUsize,
}

impl Server for CountingServer {
    fn add_client_session(&self, session: &Arc<ClientSession>) {
        self.sessions.lock().push(Arc::clone(session));
        let _ = self.adds.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_client_session(&self, session: &ClientSession) {
        self.sessions.lock().retain(|s| s.id() != session.id());
        let _ = self.removes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    server: Arc<CountingServer>,
    pool: Arc<MessagePool>,
    listener: Arc<Listener>,
    addr: std::net::SocketAddr,
}

async fn start(registry: HandlerRegistry) -> Fixture {
    let server = Arc::new(CountingServer::default());
    let pool = MessagePool::new(Box::new(DefaultMessageFactory::default()));
    let wiring = SessionWiring {
        server: Arc::clone(&server) as Arc<dyn Server>,
        pool: Arc::clone(&pool),
        registry: Arc::new(registry),
        wire: Arc::new(LengthPrefixed::default()),
    };
    let listener = Listener::new(
        ListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            accept_timeout_ms: 50,
            ..ListenerConfig::default()
        },
        ConnectionFactory::Session(Box::new(wiring)),
    );
    drop(tokio::spawn(Arc::clone(&listener).run()));
    let addr = listener
        .wait_until_listening()
        .await
        .expect("listener failed to bind");
    Fixture {
        server,
        pool,
        listener,
        addr,
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn outbound(pool: &Arc<MessagePool>, id: u16, body: &[u8]) -> OutboundMessage {
    let mut message = pool.acquire(MessageId(id));
    message.body_mut().extend_from_slice(body);
    OutboundMessage::Unique(message)
}

/// Read frames off the client socket until `count` have been decoded.
async fn read_frames(stream: &mut TcpStream, count: usize) -> Vec<(MessageId, Vec<u8>)> {
    let wire = LengthPrefixed::default();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    while frames.len() < count {
        if let Some(frame) = wire.decode(&mut buf).unwrap() {
            frames.push((frame.id, frame.payload.to_vec()));
            continue;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_buf(&mut buf))
            .await
            .expect("timed out reading frame")
            .unwrap();
        assert!(n > 0, "connection closed before all frames arrived");
    }
    frames
}

#[tokio::test]
async fn standby_messages_flush_in_order_before_later_posts() {
    let fx = start(HandlerRegistry::new()).await;
    let mut client = TcpStream::connect(fx.addr).await.unwrap();
    wait_for("session add", || fx.server.adds.load(Ordering::SeqCst) == 1).await;
    let session = fx.server.sessions.lock()[0].clone();

    // Posted while the session is still starting up: parked on standby.
    assert!(session.post_output_message(outbound(&fx.pool, 1, b"early"), true, true));
    session.set_online();
    assert!(session.post_output_message(outbound(&fx.pool, 3, b"late"), true, true));

    let frames = read_frames(&mut client, 2).await;
    assert_eq!(frames[0], (MessageId(1), b"early".to_vec()));
    assert_eq!(frames[1], (MessageId(3), b"late".to_vec()));

    session.shutdown(ShutdownInitiator::Server).await;
    wait_for("session remove", || {
        fx.server.removes.load(Ordering::SeqCst) == 1
    })
    .await;

    // The server closed the connection; the client sees EOF.
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_buf(&mut BytesMut::new()))
        .await
        .expect("timed out waiting for close")
        .unwrap();
    assert_eq!(n, 0);

    wait_for("connection untracked", || {
        fx.listener.active_connection_count() == 0
    })
    .await;
    fx.listener.stop();
}

#[tokio::test]
async fn client_close_tears_the_session_down() {
    let fx = start(HandlerRegistry::new()).await;
    let client = TcpStream::connect(fx.addr).await.unwrap();
    wait_for("session add", || fx.server.adds.load(Ordering::SeqCst) == 1).await;

    drop(client);
    wait_for("session remove", || {
        fx.server.removes.load(Ordering::SeqCst) == 1
    })
    .await;
    wait_for("connection untracked", || {
        fx.listener.active_connection_count() == 0
    })
    .await;
    assert!(fx.server.sessions.lock().is_empty());
    fx.listener.stop();
}

#[tokio::test]
async fn repeated_shutdown_notifies_the_server_once() {
    let fx = start(HandlerRegistry::new()).await;
    let _client = TcpStream::connect(fx.addr).await.unwrap();
    wait_for("session add", || fx.server.adds.load(Ordering::SeqCst) == 1).await;
    let session = fx.server.sessions.lock()[0].clone();

    for _ in 0..4 {
        session.shutdown(ShutdownInitiator::Server).await;
    }
    wait_for("session remove", || {
        fx.server.removes.load(Ordering::SeqCst) >= 1
    })
    .await;
    // Settle, then confirm no further removals arrived.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.server.removes.load(Ordering::SeqCst), 1);
    fx.listener.stop();
}

#[tokio::test]
async fn listener_stop_closes_every_connection() {
    let fx = start(HandlerRegistry::new()).await;
    let mut a = TcpStream::connect(fx.addr).await.unwrap();
    let mut b = TcpStream::connect(fx.addr).await.unwrap();
    wait_for("both sessions added", || {
        fx.server.adds.load(Ordering::SeqCst) == 2
    })
    .await;
    assert_eq!(fx.listener.enumerate_active_sockets().len(), 2);

    fx.listener.stop();
    wait_for("both sessions removed", || {
        fx.server.removes.load(Ordering::SeqCst) == 2
    })
    .await;

    for client in [&mut a, &mut b] {
        let n = tokio::time::timeout(
            Duration::from_secs(5),
            client.read_buf(&mut BytesMut::new()),
        )
        .await
        .expect("timed out waiting for close")
        .unwrap();
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn stop_socket_thread_targets_one_connection() {
    let fx = start(HandlerRegistry::new()).await;
    let mut doomed = TcpStream::connect(fx.addr).await.unwrap();
    let _spared = TcpStream::connect(fx.addr).await.unwrap();
    wait_for("both sessions added", || {
        fx.server.adds.load(Ordering::SeqCst) == 2
    })
    .await;

    let doomed_port = doomed.local_addr().unwrap().port();
    let target = fx
        .listener
        .enumerate_active_sockets()
        .into_iter()
        .find(|info| info.peer_address.ends_with(&format!(":{doomed_port}")))
        .expect("doomed connection not tracked");
    fx.listener
        .stop_socket_thread(target.socket_id, target.local_port)
        .unwrap();

    wait_for("one session removed", || {
        fx.server.removes.load(Ordering::SeqCst) == 1
    })
    .await;
    let n = tokio::time::timeout(Duration::from_secs(5), doomed.read_buf(&mut BytesMut::new()))
        .await
        .expect("timed out waiting for close")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(fx.listener.active_connection_count(), 1);
    fx.listener.stop();
}

#[tokio::test]
async fn destruction_waits_for_attached_tasks() {
    let fx = start(HandlerRegistry::new()).await;
    let _client = TcpStream::connect(fx.addr).await.unwrap();
    wait_for("session add", || fx.server.adds.load(Ordering::SeqCst) == 1).await;
    let session = fx.server.sessions.lock()[0].clone();

    let task = session.attach_task();
    session.shutdown(ShutdownInitiator::Server).await;
    wait_for("session remove", || {
        fx.server.removes.load(Ordering::SeqCst) == 1
    })
    .await;

    // Finalization (and so the listener notification) is gated on the
    // attached task.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.listener.active_connection_count(), 1);

    session.detach_task(task);
    wait_for("connection untracked", || {
        fx.listener.active_connection_count() == 0
    })
    .await;
    fx.listener.stop();
}

#[tokio::test]
async fn release_and_reuse_through_the_pool() {
    let fx = start(HandlerRegistry::new()).await;
    let _client = TcpStream::connect(fx.addr).await.unwrap();
    wait_for("session add", || fx.server.adds.load(Ordering::SeqCst) == 1).await;
    let session = fx.server.sessions.lock()[0].clone();

    // Session still starting up and message parked; teardown must release
    // it back to the pool rather than leaking it.
    let mut message: Message = fx.pool.acquire(MessageId(2));
    message.body_mut().extend_from_slice(b"parked");
    assert!(session.post_output_message(OutboundMessage::Unique(message), true, true));
    assert_eq!(fx.pool.free_len(), 0);

    session.shutdown(ShutdownInitiator::Server).await;
    wait_for("message back in pool", || fx.pool.free_len() == 1).await;
    fx.listener.stop();
}
