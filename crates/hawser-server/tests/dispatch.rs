//! Handler dispatch over a live connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use hawser_core::{
    DefaultMessageFactory, LengthPrefixed, Message, MessageId, MessagePool, WireFormat,
};
use hawser_server::{
    ClientSession, ConnectionFactory, HandlerContext, HandlerError, HandlerRegistry, Listener,
    ListenerConfig, MessageHandler, OutboundMessage, Server, SessionWiring,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Default)]
struct CountingServer {
    sessions: Mutex<Vec<Arc<ClientSession>>>,
    adds: AtomicUsize,
}

impl Server for CountingServer {
    fn add_client_session(&self, session: &Arc<ClientSession>) {
        self.sessions.lock().push(Arc::clone(session));
        let _ = self.adds.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_client_session(&self, session: &ClientSession) {
        self.sessions.lock().retain(|s| s.id() != session.id());
    }
}

/// Sends the inbound message straight back to its session.
struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn process(&mut self, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        let message = ctx
            .take_message()
            .ok_or_else(|| HandlerError(anyhow::anyhow!("no message to echo")))?;
        let session = ctx
            .session()
            .ok_or_else(|| HandlerError(anyhow::anyhow!("echo needs a session")))?;
        let _ = session.post_output_message(OutboundMessage::Unique(message), true, false);
        Ok(())
    }
}

async fn start(registry: HandlerRegistry) -> (Arc<CountingServer>, Arc<Listener>, TcpStream) {
    let server = Arc::new(CountingServer::default());
    let pool = MessagePool::new(Box::new(DefaultMessageFactory::default()));
    let wiring = SessionWiring {
        server: Arc::clone(&server) as Arc<dyn Server>,
        pool,
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
    let client = TcpStream::connect(addr).await.unwrap();
    (server, listener, client)
}

async fn send_frame(stream: &mut TcpStream, id: u16, body: &[u8]) {
    let wire = LengthPrefixed::default();
    let mut message = Message::new(MessageId(id), body.len());
    message.body_mut().extend_from_slice(body);
    let mut buf = BytesMut::new();
    wire.encode(&message, &mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
}

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
async fn registered_messages_are_echoed_in_order() {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            MessageId(42),
            "echo",
            Box::new(|| Box::new(EchoHandler) as Box<dyn MessageHandler>),
        )
        .unwrap();
    let (_server, listener, mut client) = start(registry).await;

    send_frame(&mut client, 42, b"ping").await;
    send_frame(&mut client, 42, b"pong").await;

    let frames = read_frames(&mut client, 2).await;
    assert_eq!(frames[0], (MessageId(42), b"ping".to_vec()));
    assert_eq!(frames[1], (MessageId(42), b"pong".to_vec()));
    listener.stop();
}

#[tokio::test]
async fn unregistered_messages_are_discarded_without_killing_the_connection() {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            MessageId(42),
            "echo",
            Box::new(|| Box::new(EchoHandler) as Box<dyn MessageHandler>),
        )
        .unwrap();
    let (_server, listener, mut client) = start(registry).await;

    // No handler for 99; the frame is dropped and the session keeps going.
    send_frame(&mut client, 99, b"junk").await;
    send_frame(&mut client, 42, b"still alive").await;

    let frames = read_frames(&mut client, 1).await;
    assert_eq!(frames[0], (MessageId(42), b"still alive".to_vec()));
    listener.stop();
}

#[tokio::test]
async fn failing_handler_is_fatal_to_its_connection() {
    struct Failing;
    #[async_trait]
    impl MessageHandler for Failing {
        async fn process(&mut self, _ctx: &mut HandlerContext) -> Result<(), HandlerError> {
            Err(HandlerError(anyhow::anyhow!("induced failure")))
        }
    }

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            MessageId(7),
            "failing",
            Box::new(|| Box::new(Failing) as Box<dyn MessageHandler>),
        )
        .unwrap();
    let (_server, listener, mut client) = start(registry).await;

    send_frame(&mut client, 7, b"boom").await;

    // The session shuts down; the client sees the connection close.
    let mut buf = BytesMut::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection never closed"
        );
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_buf(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        if n == 0 {
            break;
        }
    }
    listener.stop();
}

#[tokio::test]
async fn broadcast_reaches_every_connected_client() {
    let (server, listener, mut a) = start(HandlerRegistry::new()).await;
    let addr = listener.wait_until_listening().await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.adds.load(Ordering::SeqCst) < 2 {
        assert!(tokio::time::Instant::now() < deadline, "sessions never added");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sessions: Vec<Arc<ClientSession>> = server.sessions.lock().clone();
    for session in &sessions {
        session.set_online();
    }

    let pool = MessagePool::new(Box::new(DefaultMessageFactory::default()));
    let mut message = pool.acquire(MessageId(5));
    message.body_mut().extend_from_slice(b"to all");
    let accepted = hawser_server::post_broadcast_message(&sessions, message, false);
    assert_eq!(accepted, 2);

    for client in [&mut a, &mut b] {
        let frames = read_frames(client, 1).await;
        assert_eq!(frames[0], (MessageId(5), b"to all".to_vec()));
    }
    listener.stop();
}
