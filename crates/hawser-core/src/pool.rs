//! Message recycling.
//!
//! A [`MessagePool`] hands out messages from a free list when it can and asks
//! its [`MessageFactory`] for a fresh one when it cannot, so steady-state
//! traffic does not allocate per message. Releases must go to the pool that
//! produced the message; a cross-pool release is a contract violation that is
//! logged and routed to the owning pool rather than corrupting the wrong
//! free list.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::message::{Message, MessageId, RecyclePolicy};

/// Builds messages of the concrete subtype a protocol uses. Supplied to a
/// [`MessagePool`] so it can instantiate new messages on demand.
pub trait MessageFactory: Send + Sync {
    /// Instantiate a new message with the given id.
    fn create_message(&self, id: MessageId) -> Message;
}

/// Factory for plain messages with a fixed initial buffer capacity.
#[derive(Debug, Clone)]
pub struct DefaultMessageFactory {
    initial_capacity: usize,
}

impl DefaultMessageFactory {
    /// Factory producing messages with `initial_capacity` byte buffers.
    pub fn new(initial_capacity: usize) -> Self {
        Self { initial_capacity }
    }
}

impl Default for DefaultMessageFactory {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageFactory for DefaultMessageFactory {
    fn create_message(&self, id: MessageId) -> Message {
        Message::new(id, self.initial_capacity)
    }
}

/// Point-in-time pool counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquires satisfied by recycling a pooled message.
    pub acquired_from_pool: u64,
    /// Acquires that had to construct a new message.
    pub created_new: u64,
    /// Releases that returned a message to the free list.
    pub released_to_pool: u64,
    /// Releases dropped because the free list was at capacity.
    pub dropped_over_cap: u64,
}

/// Recycles [`Message`] instances to avoid allocation churn.
pub struct MessagePool {
    factory: Box<dyn MessageFactory>,
    free: Mutex<Vec<Message>>,
    max_free: usize,
    acquired_from_pool: AtomicU64,
    created_new: AtomicU64,
    released_to_pool: AtomicU64,
    dropped_over_cap: AtomicU64,
}

/// Free-list cap used by [`MessagePool::new`].
const DEFAULT_MAX_FREE: usize = 64;

impl MessagePool {
    /// Create a pool with the default free-list cap.
    pub fn new(factory: Box<dyn MessageFactory>) -> Arc<Self> {
        Self::with_max_free(factory, DEFAULT_MAX_FREE)
    }

    /// Create a pool that keeps at most `max_free` recycled messages.
    pub fn with_max_free(factory: Box<dyn MessageFactory>, max_free: usize) -> Arc<Self> {
        Arc::new(Self {
            factory,
            free: Mutex::new(Vec::new()),
            max_free,
            acquired_from_pool: AtomicU64::new(0),
            created_new: AtomicU64::new(0),
            released_to_pool: AtomicU64::new(0),
            dropped_over_cap: AtomicU64::new(0),
        })
    }

    /// Hand out a message: recycled from the free list when one is available
    /// (reset to empty, id set), freshly constructed otherwise.
    pub fn acquire(self: &Arc<Self>, id: MessageId) -> Message {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(mut message) => {
                message.recycle(id, RecyclePolicy::MakeEmpty);
                let _ = self.acquired_from_pool.fetch_add(1, Ordering::Relaxed);
                trace!(%id, "recycled message from pool");
                message
            }
            None => {
                let mut message = self.factory.create_message(id);
                message.bind_pool(self);
                let _ = self.created_new.fetch_add(1, Ordering::Relaxed);
                trace!(%id, "pool empty, created new message");
                message
            }
        }
    }

    /// Return a message to this pool's free list.
    ///
    /// A message still marked for broadcast must not land here directly; its
    /// [`SharedMessage`](crate::message::SharedMessage) wrapper performs the
    /// final release. A message recorded against a different pool is routed
    /// to that pool instead of being kept.
    pub fn release(self: &Arc<Self>, message: Message) {
        if message.is_broadcast() {
            error!(
                id = %message.id(),
                "refusing to pool a message still marked for broadcast; dropping"
            );
            return;
        }
        if !message.pool().ptr_eq(&Arc::downgrade(self)) {
            match message.pool().upgrade() {
                Some(owner) => {
                    error!(
                        id = %message.id(),
                        "message released to a pool other than its own; routing to owning pool"
                    );
                    owner.release(message);
                }
                None => {
                    error!(id = %message.id(), "message released to a foreign pool and its own pool is gone; dropping");
                }
            }
            return;
        }

        let mut free = self.free.lock();
        if free.len() >= self.max_free {
            let _ = self.dropped_over_cap.fetch_add(1, Ordering::Relaxed);
            trace!(id = %message.id(), "free list at capacity, dropping released message");
            return;
        }
        trace!(id = %message.id(), "message returned to pool");
        free.push(message);
        let _ = self.released_to_pool.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of messages currently sitting in the free list.
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired_from_pool: self.acquired_from_pool.load(Ordering::Relaxed),
            created_new: self.created_new.load(Ordering::Relaxed),
            released_to_pool: self.released_to_pool.load(Ordering::Relaxed),
            dropped_over_cap: self.dropped_over_cap.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<MessagePool> {
        MessagePool::new(Box::new(DefaultMessageFactory::default()))
    }

    #[test]
    fn acquire_constructs_when_empty_and_recycles_after_release() {
        let pool = pool();
        let mut m = pool.acquire(MessageId(1));
        m.body_mut().extend_from_slice(b"junk");
        pool.release(m);
        assert_eq!(pool.free_len(), 1);

        // The recycled message comes back empty with the new id.
        let m = pool.acquire(MessageId(2));
        assert_eq!(pool.free_len(), 0);
        assert_eq!(m.id(), MessageId(2));
        assert_eq!(m.body_len(), 0);

        let stats = pool.stats();
        assert_eq!(stats.created_new, 1);
        assert_eq!(stats.acquired_from_pool, 1);
        assert_eq!(stats.released_to_pool, 1);
    }

    #[test]
    fn release_is_counted_once_per_message() {
        let pool = pool();
        let m = pool.acquire(MessageId(1));
        m.release();
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.stats().released_to_pool, 1);
    }

    #[test]
    fn cross_pool_release_routes_to_owning_pool() {
        let owner = pool();
        let other = pool();
        let m = owner.acquire(MessageId(3));
        other.release(m);
        assert_eq!(other.free_len(), 0);
        assert_eq!(owner.free_len(), 1);
    }

    #[test]
    fn foreign_message_with_no_pool_is_dropped() {
        let pool = pool();
        pool.release(Message::new(MessageId(1), 16));
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn free_list_cap_drops_overflow() {
        let pool = MessagePool::with_max_free(Box::new(DefaultMessageFactory::default()), 1);
        let a = pool.acquire(MessageId(1));
        let b = pool.acquire(MessageId(1));
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.stats().dropped_over_cap, 1);
    }
}
