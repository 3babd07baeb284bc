//! The owning server's view of the session collection.

use std::sync::Arc;

use crate::session::ClientSession;

/// Callbacks into the server that owns the session collection.
///
/// The core calls back into the server only here: `add_client_session` when
/// a session is created by the connection-acceptance path, and
/// `remove_client_session` at the point both of a session's workers have
/// stopped. Each is called exactly once per session.
pub trait Server: Send + Sync {
    /// A session was created for an accepted connection.
    fn add_client_session(&self, session: &Arc<ClientSession>);

    /// Both of this session's workers have stopped; drop it from the
    /// collection. The session finalizes itself after this returns.
    fn remove_client_session(&self, session: &ClientSession);
}
