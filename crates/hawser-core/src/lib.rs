//! # hawser-core
//!
//! Foundation types for the hawser socket server framework:
//!
//! - **Messages**: [`message::Message`] — recyclable id + payload buffers
//! - **Broadcast**: [`message::SharedMessage`] — one buffer shared across N
//!   fan-out targets, returned to its pool by the last release
//! - **Pooling**: [`pool::MessagePool`] with a pluggable [`pool::MessageFactory`]
//! - **Framing**: the [`wire::WireFormat`] seam plus a default
//!   length-prefixed implementation
//! - **Errors**: [`error::FrameError`] via `thiserror`
//! - **Logging**: [`logging::init`] for `tracing` setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `hawser-server` and by applications that
//! define their own wire protocols and message subtypes.

#![deny(unsafe_code)]

pub mod error;
pub mod logging;
pub mod message;
pub mod pool;
pub mod wire;

pub use error::FrameError;
pub use message::{Message, MessageId, RecyclePolicy, SharedMessage};
pub use pool::{DefaultMessageFactory, MessageFactory, MessagePool, PoolStats};
pub use wire::{Frame, LengthPrefixed, WireFormat};
