//! Recyclable message buffers and the broadcast fan-out guard.
//!
//! A [`Message`] is a mutable id + payload buffer that belongs to the
//! [`MessagePool`](crate::pool::MessagePool) that produced it and is returned
//! there when released. On the normal path a message has exactly one consumer;
//! on the broadcast path it is wrapped in a [`SharedMessage`] whose pending
//! target count is fixed up front, and the release that drops the count to
//! zero performs the actual pool return.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{error, trace};

use crate::pool::MessagePool;

/// Protocol verb distinguishing a message from other messages in a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u16);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What [`Message::recycle`] does with the payload already in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecyclePolicy {
    /// Reset the payload to empty. This is what pooling wants.
    #[default]
    MakeEmpty,
    /// Leave the payload intact so the recycled message carries it forward.
    KeepData,
}

/// A mutable, recyclable buffer carrying a message id and opaque payload
/// bytes.
///
/// Serialization to and from a particular wire format is deferred to a
/// [`WireFormat`](crate::wire::WireFormat) implementation; this type is only
/// the carrier. Messages remember the pool that produced them and must be
/// released back to it, never to another pool.
pub struct Message {
    id: MessageId,
    body: BytesMut,
    pool: Weak<MessagePool>,
    broadcast: bool,
}

impl Message {
    /// Construct a free-standing message with the given initial buffer
    /// capacity. Pool-produced messages come from
    /// [`MessagePool::acquire`](crate::pool::MessagePool::acquire) instead.
    pub fn new(id: MessageId, initial_capacity: usize) -> Self {
        Self {
            id,
            body: BytesMut::with_capacity(initial_capacity),
            pool: Weak::new(),
            broadcast: false,
        }
    }

    /// The message id.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Set the message id, used when filling a message for send.
    pub fn set_id(&mut self, id: MessageId) {
        self.id = id;
    }

    /// The payload bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Mutable access to the payload buffer for filling.
    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Payload length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Total buffer space currently consumed by this message, for logging.
    pub fn capacity(&self) -> usize {
        self.body.capacity()
    }

    /// True once this message has been marked for broadcast fan-out.
    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Re-initialize the message as if freshly constructed, so a pooled
    /// instance can be handed out again.
    pub fn recycle(&mut self, id: MessageId, policy: RecyclePolicy) {
        self.id = id;
        self.broadcast = false;
        if policy == RecyclePolicy::MakeEmpty {
            self.body.clear();
        }
    }

    /// Append this message's payload to `target` at its current end.
    ///
    /// The target's id and broadcast state are not altered.
    pub fn copy_body_to(&self, target: &mut Message) {
        target.body.extend_from_slice(&self.body);
    }

    /// The pool this message belongs to. Empty for free-standing messages.
    pub fn pool(&self) -> Weak<MessagePool> {
        self.pool.clone()
    }

    /// Return this message to the pool that produced it. A message whose pool
    /// is gone (or that never had one) is simply dropped.
    pub fn release(self) {
        match self.pool.upgrade() {
            Some(pool) => pool.release(self),
            None => trace!(id = %self.id, "message has no live pool, dropping"),
        }
    }

    pub(crate) fn bind_pool(&mut self, pool: &Arc<MessagePool>) {
        self.pool = Arc::downgrade(pool);
    }

    fn mark_broadcast(&mut self) {
        self.broadcast = true;
    }

    fn clear_broadcast(&mut self) {
        self.broadcast = false;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("broadcast", &self.broadcast)
            .finish_non_exhaustive()
    }
}

struct SharedState {
    message: Option<Message>,
    remaining: u32,
}

struct SharedInner {
    id: MessageId,
    state: Mutex<SharedState>,
}

/// One inbound event fanned out to many session output queues without
/// deep-copying the payload.
///
/// The pending target count is fixed at construction, before any handle is
/// visible to a consumer, so the whole add-targets-then-deliver sequence is
/// linearizable without caller-side locking. Every target must call
/// [`release`](SharedMessage::release) exactly once; the release that drops
/// the count to zero returns the underlying message to its pool, and any
/// further release is a logged no-op.
#[derive(Clone)]
pub struct SharedMessage {
    inner: Arc<SharedInner>,
}

impl SharedMessage {
    /// Wrap `message` for delivery to `targets` pending consumers.
    ///
    /// A count of zero is clamped to one so the wrapping caller still owes
    /// the single release.
    pub fn new(mut message: Message, targets: u32) -> Self {
        message.mark_broadcast();
        let id = message.id();
        trace!(%id, targets, "marking message for broadcast");
        Self {
            inner: Arc::new(SharedInner {
                id,
                state: Mutex::new(SharedState {
                    message: Some(message),
                    remaining: targets.max(1),
                }),
            }),
        }
    }

    /// The wrapped message's id.
    pub fn id(&self) -> MessageId {
        self.inner.id
    }

    /// Number of targets that have not yet released their slot.
    pub fn remaining(&self) -> u32 {
        self.inner.state.lock().remaining
    }

    /// Read access to the wrapped message, for encoding.
    ///
    /// # Panics
    ///
    /// Panics if called after the final release has returned the message to
    /// its pool; a target must read before releasing its slot.
    pub fn read(&self) -> MappedMutexGuard<'_, Message> {
        MutexGuard::map(self.inner.state.lock(), |state| {
            state
                .message
                .as_mut()
                .expect("broadcast message read after final release")
        })
    }

    /// Release one target's slot. The release that reaches zero returns the
    /// message to its pool; releases beyond the target count are logged and
    /// ignored.
    pub fn release(&self) {
        let last = {
            let mut state = self.inner.state.lock();
            if state.remaining == 0 {
                error!(id = %self.inner.id, "broadcast message released more times than it has targets");
                return;
            }
            state.remaining -= 1;
            if state.remaining == 0 {
                state.message.take()
            } else {
                None
            }
        };
        if let Some(mut message) = last {
            trace!(id = %self.inner.id, "last broadcast target done, releasing message");
            message.clear_broadcast();
            message.release();
        }
    }
}

impl fmt::Debug for SharedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMessage")
            .field("id", &self.inner.id)
            .field("remaining", &self.remaining())
            .finish()
    }
}
