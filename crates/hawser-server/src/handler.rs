//! Dispatch of inbound messages to registered handlers.
//!
//! The registry maps each message id to a handler factory. The input worker
//! looks up the factory for every decoded frame and gets back a fresh
//! [`DispatchedHandler`] wrapping a new handler instance, so handler state
//! never leaks between messages or sessions. A handler registered as
//! exclusive additionally carries a shared async mutex: only one instance of
//! that handler runs at a time across all sessions, and the lock is taken
//! before the handler's `process` starts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hawser_core::{Message, MessageId};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::server::Server;
use crate::session::ClientSession;

/// A handler's `process` failed. Fatal to the connection the message
/// arrived on; the input worker logs it and shuts the session down.
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(#[from] pub anyhow::Error);

/// Everything a handler may touch while processing one message.
pub struct HandlerContext {
    server: Arc<dyn Server>,
    session: Option<Arc<ClientSession>>,
    message: Option<Message>,
    exclusive: Option<OwnedMutexGuard<()>>,
    exclusive_mutex: Option<Arc<Mutex<()>>>,
}

impl HandlerContext {
    /// The server owning the session collection.
    pub fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    /// The session the message arrived on, when it arrived on one.
    pub fn session(&self) -> Option<&Arc<ClientSession>> {
        self.session.as_ref()
    }

    /// The message being processed, unless the handler already took it.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Mutable access to the message being processed.
    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.message.as_mut()
    }

    /// Take ownership of the message. The handler becomes responsible for
    /// releasing it (posting it somewhere counts); a message left in the
    /// context is released automatically after `process` returns.
    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    /// Drop the exclusivity lock before `process` returns, letting the next
    /// instance of this handler start while this one finishes slow,
    /// lock-free work. No-op for non-exclusive handlers.
    pub fn release_exclusive_early(&mut self) {
        self.exclusive = None;
    }

    /// Re-take the exclusivity lock released by
    /// [`release_exclusive_early`](Self::release_exclusive_early). No-op if
    /// the lock is held or the handler is not exclusive.
    pub async fn reacquire_exclusive(&mut self) {
        if self.exclusive.is_none() {
            if let Some(mutex) = &self.exclusive_mutex {
                self.exclusive = Some(Arc::clone(mutex).lock_owned().await);
            }
        }
    }
}

/// Processes messages of one id.
///
/// Implementations are created per message by a [`HandlerFactory`], so
/// `&mut self` state is private to a single `process` call's lifetime.
#[async_trait]
pub trait MessageHandler: Send {
    /// Process one message. The message is in `ctx` unless taken.
    async fn process(&mut self, ctx: &mut HandlerContext) -> Result<(), HandlerError>;
}

/// Creates a fresh handler instance for each dispatched message.
pub trait HandlerFactory: Send + Sync {
    /// Build one handler instance.
    fn create_handler(&self) -> Box<dyn MessageHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn MessageHandler> + Send + Sync,
{
    fn create_handler(&self) -> Box<dyn MessageHandler> {
        self()
    }
}

/// Registration failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A factory is already registered for this id.
    #[error("a handler is already registered for message id {0}")]
    DuplicateHandler(MessageId),
}

struct HandlerEntry {
    name: &'static str,
    factory: Box<dyn HandlerFactory>,
    exclusive: Option<Arc<Mutex<()>>>,
}

/// Maps message ids to handler factories.
///
/// Built once during server assembly and shared read-only with every input
/// worker, so lookup takes no lock.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<MessageId, HandlerEntry>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for messages with `id`. `name` labels the handler
    /// in dispatch logs.
    pub fn register(
        &mut self,
        id: MessageId,
        name: &'static str,
        factory: Box<dyn HandlerFactory>,
    ) -> Result<(), RegistryError> {
        self.insert(id, name, factory, None)
    }

    /// Like [`register`](Self::register), but at most one instance of this
    /// handler processes at a time, across all sessions.
    pub fn register_exclusive(
        &mut self,
        id: MessageId,
        name: &'static str,
        factory: Box<dyn HandlerFactory>,
    ) -> Result<(), RegistryError> {
        self.insert(id, name, factory, Some(Arc::new(Mutex::new(()))))
    }

    fn insert(
        &mut self,
        id: MessageId,
        name: &'static str,
        factory: Box<dyn HandlerFactory>,
        exclusive: Option<Arc<Mutex<()>>>,
    ) -> Result<(), RegistryError> {
        if self.factories.contains_key(&id) {
            return Err(RegistryError::DuplicateHandler(id));
        }
        let _ = self.factories.insert(
            id,
            HandlerEntry {
                name,
                factory,
                exclusive,
            },
        );
        Ok(())
    }

    /// True if a handler is registered for `id`.
    pub fn contains(&self, id: MessageId) -> bool {
        self.factories.contains_key(&id)
    }

    /// Number of registered ids.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Look up the handler for `message` and instantiate it.
    ///
    /// Returns `None` for an unregistered id; the caller owns the decision
    /// of what to do with the unhandled message. Logs dispatch metadata, and
    /// a hex dump of the payload when the `hawser::dispatch::hex` target is
    /// enabled at trace level.
    pub fn dispatch(&self, message: &Message, session_label: &str) -> Option<DispatchedHandler> {
        debug!(
            target: "hawser::dispatch",
            session = session_label,
            id = %message.id(),
            len = message.body_len(),
            "inbound message"
        );
        if tracing::enabled!(target: "hawser::dispatch::hex", tracing::Level::TRACE) {
            tracing::trace!(
                target: "hawser::dispatch::hex",
                session = session_label,
                id = %message.id(),
                dump = %hex_dump(message.body()),
                "inbound payload"
            );
        }

        let entry = self.factories.get(&message.id())?;
        debug!(
            target: "hawser::dispatch",
            session = session_label,
            id = %message.id(),
            handler = entry.name,
            "dispatching to handler"
        );
        Some(DispatchedHandler {
            name: entry.name,
            handler: entry.factory.create_handler(),
            exclusive: entry.exclusive.clone(),
        })
    }
}

/// A freshly created handler instance, bound to one message's processing.
pub struct DispatchedHandler {
    name: &'static str,
    handler: Box<dyn MessageHandler>,
    exclusive: Option<Arc<Mutex<()>>>,
}

impl DispatchedHandler {
    /// Log label of the handler about to run.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the handler on `message`.
    ///
    /// Waits on the exclusivity lock first when the handler was registered
    /// exclusive. A message the handler leaves in the context is released
    /// back to its pool afterward, whether `process` succeeded or failed.
    pub async fn process(
        mut self,
        server: Arc<dyn Server>,
        session: Option<Arc<ClientSession>>,
        message: Message,
    ) -> Result<(), HandlerError> {
        let guard = match &self.exclusive {
            Some(mutex) => Some(Arc::clone(mutex).lock_owned().await),
            None => None,
        };
        let mut ctx = HandlerContext {
            server,
            session,
            message: Some(message),
            exclusive: guard,
            exclusive_mutex: self.exclusive.clone(),
        };
        let result = self.handler.process(&mut ctx).await;
        if let Some(leftover) = ctx.message.take() {
            leftover.release();
        }
        result
    }
}

/// True when [`log_message_details`] would emit, so handlers can skip
/// building an expensive rendering that would go nowhere.
pub fn would_log_details() -> bool {
    tracing::enabled!(target: "hawser::dispatch::detail", tracing::Level::TRACE)
}

/// Emit a handler-supplied readable rendering of a message's fields.
pub fn log_message_details(session_label: &str, id: MessageId, details: &str) {
    tracing::trace!(
        target: "hawser::dispatch::detail",
        session = session_label,
        id = %id,
        details,
        "message details"
    );
}

/// Render `bytes` as an offset-prefixed hex/ASCII dump, 16 bytes per line.
pub fn hex_dump(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 4);
    for (line, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
