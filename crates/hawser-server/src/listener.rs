//! The accept loop and its view of live connections.
//!
//! A [`Listener`] owns one bound port. While listening it accepts
//! connections and hands each socket to its [`ConnectionFactory`], which
//! wires a full client session or a bare socket task and returns the
//! [`ConnectionHandle`] the listener tracks. Listening can be turned off and
//! back on without tearing the listener down; the accept loop polls its
//! flags on an accept timeout so state changes are noticed within one
//! timeout period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::{SessionWiring, spawn_session};

/// Identifies one accepted socket for the lifetime of its connection.
pub type SocketId = i32;

/// Listener settings, loadable from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Local address to bind.
    pub bind_address: String,
    /// Port to bind; `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// How long one `accept` waits before the loop re-checks its flags.
    pub accept_timeout_ms: u64,
    /// How often a non-listening listener re-checks whether to listen.
    pub idle_poll_ms: u64,
    /// Whether the listener starts out accepting connections.
    pub initially_listening: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 0,
            accept_timeout_ms: 1000,
            idle_poll_ms: 250,
            initially_listening: true,
        }
    }
}

impl ListenerConfig {
    fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Listener failures surfaced to callers.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Binding the accept socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying socket error.
        source: std::io::Error,
    },
    /// No tracked connection matches the given socket id and port.
    #[error("no connection with socket id {socket_id} on port {port}")]
    SocketThreadNotFound {
        /// Socket id that was searched for.
        socket_id: SocketId,
        /// Local port that was searched for.
        port: u16,
    },
}

/// Snapshot of one tracked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    /// Socket id of the connection.
    pub socket_id: SocketId,
    /// Local port the connection was accepted on.
    pub local_port: u16,
    /// The client's `"<ip>:<port>"` label.
    pub peer_address: String,
}

/// A tracked connection: identity plus the token that stops its workers.
pub struct ConnectionHandle {
    pub(crate) socket_id: SocketId,
    pub(crate) local_port: u16,
    pub(crate) peer_address: String,
    pub(crate) cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Socket id of the connection.
    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    /// Local port the connection was accepted on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The client's `"<ip>:<port>"` label.
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    fn info(&self) -> SocketInfo {
        SocketInfo {
            socket_id: self.socket_id,
            local_port: self.local_port,
            peer_address: self.peer_address.clone(),
        }
    }
}

/// Wires a full client session (input and output workers, server
/// notification) around an accepted socket.
pub trait SessionFactory: Send + Sync {
    /// Build the session and its workers; return the handle to track.
    fn create_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: &Arc<Listener>,
    ) -> ConnectionHandle;
}

impl SessionFactory for SessionWiring {
    fn create_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: &Arc<Listener>,
    ) -> ConnectionHandle {
        let (_session, handle) = spawn_session(self, stream, peer, Some(listener));
        handle
    }
}

/// Wires a bare socket task, for protocols that want the accepted socket
/// without the session machinery.
pub trait SocketTaskFactory: Send + Sync {
    /// Spawn whatever serves this socket; return the handle to track.
    fn create_socket_task(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: &Arc<Listener>,
    ) -> ConnectionHandle;
}

/// What a listener does with each accepted socket.
pub enum ConnectionFactory {
    /// Full client sessions.
    Session(Box<dyn SessionFactory>),
    /// Bare socket tasks.
    SocketTask(Box<dyn SocketTaskFactory>),
}

impl ConnectionFactory {
    fn create(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: &Arc<Listener>,
    ) -> ConnectionHandle {
        match self {
            Self::Session(factory) => factory.create_session(stream, peer, listener),
            Self::SocketTask(factory) => factory.create_socket_task(stream, peer, listener),
        }
    }
}

/// Accepts connections on one port and tracks the connections it spawned.
pub struct Listener {
    config: ListenerConfig,
    factory: ConnectionFactory,
    should_listen: AtomicBool,
    stop: CancellationToken,
    connections: Mutex<Vec<ConnectionHandle>>,
    bound_tx: watch::Sender<Option<SocketAddr>>,
}

impl Listener {
    /// Create a listener. Nothing is bound until [`run`](Self::run) is
    /// spawned.
    pub fn new(config: ListenerConfig, factory: ConnectionFactory) -> Arc<Self> {
        let (bound_tx, _bound_rx) = watch::channel(None);
        Arc::new(Self {
            should_listen: AtomicBool::new(config.initially_listening),
            config,
            factory,
            stop: CancellationToken::new(),
            connections: Mutex::new(Vec::new()),
            bound_tx,
        })
    }

    /// The listener's main loop. Runs until [`stop`](Self::stop) is called,
    /// alternating between accepting connections and idling according to the
    /// listening flag.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            if self.should_listen.load(Ordering::Acquire) {
                self.run_listening(&self).await;
            } else {
                tokio::select! {
                    () = self.stop.cancelled() => break,
                    () = tokio::time::sleep(self.config.idle_poll()) => {}
                }
            }
        }
        debug!(port = self.config.port, "listener loop ended");
    }

    async fn run_listening(&self, this: &Arc<Self>) {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                // Leave listening mode so the outer loop idles instead of
                // hammering a bad address.
                error!(error = %ListenerError::Bind { addr, source }, "listen failed");
                self.should_listen.store(false, Ordering::Release);
                return;
            }
        };
        let bound = listener.local_addr().ok();
        if let Some(bound) = bound {
            info!(%bound, "listening");
        }
        let _ = self.bound_tx.send(bound);

        while self.should_listen.load(Ordering::Acquire) && !self.stop.is_cancelled() {
            tokio::select! {
                () = self.stop.cancelled() => break,
                accepted = timeout(self.config.accept_timeout(), listener.accept()) => {
                    match accepted {
                        // Timeout: fall through to re-check the flags.
                        Err(_) => {}
                        Ok(Err(err)) => {
                            warn!(error = %err, "accept failed");
                        }
                        Ok(Ok((stream, peer))) => self.accept_connection(this, stream, peer),
                    }
                }
            }
        }
        let _ = self.bound_tx.send(None);
        info!(port = self.config.port, "no longer listening");
    }

    fn accept_connection(&self, this: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "accepted connection");
        let handle = self.factory.create(stream, peer, this);
        debug!(
            socket_id = handle.socket_id,
            peer = %handle.peer_address,
            "tracking connection"
        );
        self.connections.lock().push(handle);
    }

    /// Resume accepting connections after [`stop_listening`](Self::stop_listening).
    pub fn start_listening(&self) {
        info!(port = self.config.port, "enabling listening");
        self.should_listen.store(true, Ordering::Release);
    }

    /// Stop accepting new connections. Existing connections are unaffected.
    /// Takes effect within one accept timeout.
    pub fn stop_listening(&self) {
        info!(port = self.config.port, "disabling listening");
        self.should_listen.store(false, Ordering::Release);
    }

    /// Whether the listener currently wants to accept connections.
    pub fn is_listening(&self) -> bool {
        self.should_listen.load(Ordering::Acquire)
    }

    /// The currently bound local address, if the accept socket is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_tx.borrow()
    }

    /// Wait until the accept socket is bound; returns its address, or `None`
    /// if the listener shut down first.
    pub async fn wait_until_listening(&self) -> Option<SocketAddr> {
        let mut rx = self.bound_tx.subscribe();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return Some(addr);
            }
            tokio::select! {
                () = self.stop.cancelled() => return None,
                changed = rx.changed() => changed.ok()?,
            }
        }
    }

    /// Shut the listener down: stop accepting and stop every tracked
    /// connection. Idempotent.
    pub fn stop(&self) {
        info!(port = self.config.port, "stopping listener");
        self.stop.cancel();
        self.stop_all_socket_threads();
    }

    /// A tracked connection ended; drop it from the live set. Called by the
    /// session's finalization, exactly once per connection.
    pub fn connection_ended(&self, socket_id: SocketId, local_port: u16) {
        let mut connections = self.connections.lock();
        match connections
            .iter()
            .position(|c| c.socket_id == socket_id && c.local_port == local_port)
        {
            Some(index) => {
                let handle = connections.swap_remove(index);
                debug!(
                    socket_id,
                    peer = %handle.peer_address,
                    "connection ended"
                );
            }
            None => {
                warn!(socket_id, local_port, "connection ended but was not tracked");
            }
        }
    }

    /// Stop the one connection identified by `socket_id` on `port`.
    pub fn stop_socket_thread(&self, socket_id: SocketId, port: u16) -> Result<(), ListenerError> {
        let cancel = {
            let connections = self.connections.lock();
            connections
                .iter()
                .find(|c| c.socket_id == socket_id && c.local_port == port)
                .map(|c| c.cancel.clone())
        };
        // Cancelling outside the lock: a stopping worker re-enters us via
        // connection_ended.
        match cancel {
            Some(cancel) => {
                info!(socket_id, port, "stopping connection");
                cancel.cancel();
                Ok(())
            }
            None => Err(ListenerError::SocketThreadNotFound { socket_id, port }),
        }
    }

    /// Stop every tracked connection.
    pub fn stop_all_socket_threads(&self) {
        let cancels: Vec<CancellationToken> = {
            let connections = self.connections.lock();
            connections.iter().map(|c| c.cancel.clone()).collect()
        };
        for cancel in cancels {
            cancel.cancel();
        }
    }

    /// Snapshot of the live connections.
    pub fn enumerate_active_sockets(&self) -> Vec<SocketInfo> {
        self.connections.lock().iter().map(ConnectionHandle::info).collect()
    }

    /// Number of live connections.
    pub fn active_connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}
