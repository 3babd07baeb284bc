//! Connection and message lifecycle core of the hawser socket server.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `session` | Per-connection state, standby queue, shutdown protocol |
//! | `worker` | Per-session input (read/dispatch) and output (write) loops |
//! | `handler` | Handler registry, dispatch by message id, handler context |
//! | `broadcast` | One message fanned out to many session output queues |
//! | `listener` | Accept loop, connection factories, live-connection tracking |
//! | `server` | The owning server's add/remove session callbacks |
//!
//! ## Data Flow
//!
//! `listener` accept → `session::spawn_session` → `worker` input loop →
//! `handler` dispatch → application handler → `session::post_output_message`
//! → `worker` output loop → socket. Shutdown flows the opposite way: any
//! initiator → `session::shutdown` → workers stop → server notified →
//! session finalized.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod handler;
pub mod listener;
pub mod server;
pub mod session;
mod worker;

pub use broadcast::post_broadcast_message;
pub use handler::{
    DispatchedHandler, HandlerContext, HandlerError, HandlerFactory, HandlerRegistry,
    MessageHandler, RegistryError, hex_dump, log_message_details, would_log_details,
};
pub use listener::{
    ConnectionFactory, ConnectionHandle, Listener, ListenerConfig, ListenerError, SessionFactory,
    SocketId, SocketInfo, SocketTaskFactory,
};
pub use server::Server;
pub use session::{
    ClientSession, OutboundMessage, SessionPhase, SessionWiring, ShutdownInitiator, TaskId,
    spawn_session,
};
