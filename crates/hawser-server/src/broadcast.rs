//! Fan-out of one message to many sessions.
//!
//! A broadcast wraps the message in a [`SharedMessage`] whose release count
//! is fixed to the number of targets before any target can see it, so the
//! message returns to its pool exactly when the last target is done with it,
//! no matter how the targets' output workers interleave.

use std::sync::Arc;

use hawser_core::{Message, SharedMessage};
use metrics::counter;
use tracing::debug;

use crate::session::{ClientSession, OutboundMessage};

/// Post one message to every session in `sessions`.
///
/// Sessions that refuse the post (shutting down, or client going offline)
/// have their share released on the spot. Returns the number of sessions
/// that accepted the message. With no targets at all the message is simply
/// released.
pub fn post_broadcast_message(
    sessions: &[Arc<ClientSession>],
    message: Message,
    queue_if_starting_up: bool,
) -> usize {
    if sessions.is_empty() {
        debug!(id = %message.id(), "broadcast with no targets, releasing message");
        message.release();
        return 0;
    }

    let shared = SharedMessage::new(message, sessions.len() as u32);
    let mut accepted = 0usize;
    for session in sessions {
        let posted = session.post_output_message(
            OutboundMessage::Shared(shared.clone()),
            true,
            queue_if_starting_up,
        );
        if posted {
            accepted += 1;
        } else {
            counter!("hawser_broadcast_drops_total").increment(1);
        }
    }
    debug!(
        id = %shared.id(),
        targets = sessions.len(),
        accepted,
        "broadcast posted"
    );
    accepted
}
