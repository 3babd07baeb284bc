//! Per-connection session state and the shutdown protocol.
//!
//! A [`ClientSession`] owns everything one connection needs: the client's
//! network identity, a standby queue for messages generated before the
//! session is online, the set of background tasks still referencing the
//! session, and handles on its two I/O workers. One mutex guards all of that
//! state as a unit, so the fields that change together during shutdown can
//! never be observed half-updated.
//!
//! Shutdown may be requested by the server, by the input worker, or by the
//! output worker — concurrently. The request is idempotent; the transition
//! to the terminal phase is claimed exactly once under the session lock, and
//! only the claimant notifies the server and finalizes. A worker that
//! requests shutdown of its own session detaches itself rather than being
//! asked to stop, which is what makes self-initiated shutdown deadlock-free.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hawser_core::{Message, MessageId, MessagePool, SharedMessage, WireFormat};
use metrics::counter;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::handler::HandlerRegistry;
use crate::listener::{ConnectionHandle, Listener, SocketId};
use crate::server::Server;
use crate::worker::{InputWorker, OutputWorker};

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Accepted but not yet through startup negotiation; outbound messages
    /// may be parked on the standby queue.
    StartingUp,
    /// Startup complete; outbound messages go straight to the output queue.
    Online,
    /// Shutdown requested; no further messages are accepted.
    ShuttingDown,
    /// Terminal. Claimed exactly once; the claimant notifies the server and
    /// finalizes the session.
    Destroyed,
}

/// Who is asking the session to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// The owning server (or any actor outside the session's own workers).
    Server,
    /// The session's own input worker, stopping itself.
    Input,
    /// The session's own output worker, stopping itself.
    Output,
}

impl ShutdownInitiator {
    fn label(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Input => "input worker",
            Self::Output => "output worker",
        }
    }
}

/// Opaque token identifying a background task attached to a session.
pub type TaskId = u64;

/// An entry on a session's output path: either a singly-owned message or one
/// slot of a broadcast fan-out.
#[derive(Debug)]
pub enum OutboundMessage {
    /// Owned by exactly one consumer.
    Unique(Message),
    /// One target's handle on a shared broadcast message.
    Shared(SharedMessage),
}

impl OutboundMessage {
    /// The carried message's id.
    pub fn id(&self) -> MessageId {
        match self {
            Self::Unique(m) => m.id(),
            Self::Shared(s) => s.id(),
        }
    }

    /// Release the message (or this target's slot of it) back toward its
    /// pool.
    pub fn release(self) {
        match self {
            Self::Unique(m) => m.release(),
            Self::Shared(s) => s.release(),
        }
    }
}

pub(crate) struct WorkerHandle {
    pub(crate) cancel: CancellationToken,
}

struct ListenerNotice {
    listener: Weak<Listener>,
    socket_id: SocketId,
    local_port: u16,
}

struct SessionState {
    phase: SessionPhase,
    standby: VecDeque<OutboundMessage>,
    tasks: HashSet<TaskId>,
    input: Option<WorkerHandle>,
    output: Option<WorkerHandle>,
    listener: Option<ListenerNotice>,
}

/// The server-side object representing one client connection.
pub struct ClientSession {
    id: Uuid,
    server: Weak<dyn Server>,
    client_ip: String,
    client_port: u16,
    client_address: String,
    state: Mutex<SessionState>,
    tasks_drained: Notify,
    output_tx: mpsc::UnboundedSender<OutboundMessage>,
    client_going_offline: AtomicBool,
    next_task_id: AtomicU64,
}

impl ClientSession {
    /// Create a session for a connection from `peer`.
    ///
    /// Returns the session and the receiving end of its output queue, which
    /// the output worker (or a test standing in for one) must own. The
    /// caller is responsible for the server's `add_client_session`
    /// notification; [`spawn_session`] does all of this wiring.
    pub fn new(
        server: &Arc<dyn Server>,
        peer: SocketAddr,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let client_ip = peer.ip().to_string();
        let client_port = peer.port();
        let session = Arc::new(Self {
            id: Uuid::now_v7(),
            server: Arc::downgrade(server),
            client_address: format!("{client_ip}:{client_port}"),
            client_ip,
            client_port,
            state: Mutex::new(SessionState {
                phase: SessionPhase::StartingUp,
                standby: VecDeque::new(),
                tasks: HashSet::new(),
                input: None,
                output: None,
                listener: None,
            }),
            tasks_drained: Notify::new(),
            output_tx,
            client_going_offline: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
        });
        info!(session = %session.client_address, "client session created");
        (session, output_rx)
    }

    /// Unique identity of this session within the server's collection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The client's `"<ip>:<port>"` display label.
    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    /// The client's IP address.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// The client's port number.
    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    /// Attach a background task handle; the session will not finalize while
    /// any attached task remains. Returns the token to pass to
    /// [`detach_task`](Self::detach_task) when the task ends.
    pub fn attach_task(&self) -> TaskId {
        let task = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.state.lock().tasks.insert(task);
        trace!(session = %self.client_address, task, "task attached");
        task
    }

    /// Detach a background task previously attached with
    /// [`attach_task`](Self::attach_task).
    pub fn detach_task(&self, task: TaskId) {
        let emptied = {
            let mut state = self.state.lock();
            let removed = state.tasks.remove(&task);
            if !removed {
                warn!(session = %self.client_address, task, "detach of unknown task");
            }
            removed && state.tasks.is_empty()
        };
        trace!(session = %self.client_address, task, "task detached");
        if emptied {
            self.tasks_drained.notify_waiters();
        }
    }

    /// Mark the client as disconnecting on its own initiative; posting
    /// refuses from here on even before shutdown is requested.
    pub fn set_client_going_offline(&self) {
        self.client_going_offline.store(true, Ordering::Release);
        debug!(session = %self.client_address, "client going offline");
    }

    /// True once the client has been marked as disconnecting.
    pub fn is_client_going_offline(&self) -> bool {
        self.client_going_offline.load(Ordering::Acquire)
    }

    /// Complete startup negotiation: the session goes online and every
    /// standby message moves to the live output queue in arrival order,
    /// ahead of anything posted after this call.
    pub fn set_online(&self) {
        let mut state = self.state.lock();
        if state.phase != SessionPhase::StartingUp {
            debug!(session = %self.client_address, phase = ?state.phase, "ignoring set_online");
            return;
        }
        state.phase = SessionPhase::Online;
        info!(session = %self.client_address, "session online");
        self.move_standby_messages_to_output_queue(&mut state);
    }

    /// Post a message toward this session's client.
    ///
    /// Refuses (returns `false`) when the session is shutting down or the
    /// client is going offline. When the session is still starting up and
    /// `queue_if_starting_up` is set, the message is parked on the standby
    /// queue instead of the live output queue. When the post is refused and
    /// `release_if_not_posted` is set, the message is released to its pool
    /// immediately; otherwise the refused caller keeps ownership (and the
    /// message has already been moved into this call, so without the flag a
    /// refusal drops it only for `Unique` messages whose caller kept no
    /// other handle — callers that need to retry must pass `false` and
    /// re-post a message they still hold a way to rebuild).
    pub fn post_output_message(
        &self,
        message: OutboundMessage,
        release_if_not_posted: bool,
        queue_if_starting_up: bool,
    ) -> bool {
        let refused = {
            let mut state = self.state.lock();
            let shutting_down = matches!(
                state.phase,
                SessionPhase::ShuttingDown | SessionPhase::Destroyed
            );
            if shutting_down || self.is_client_going_offline() {
                Some(message)
            } else if queue_if_starting_up && state.phase == SessionPhase::StartingUp {
                debug!(
                    session = %self.client_address,
                    id = %message.id(),
                    "placing message on standby queue"
                );
                state.standby.push_back(message);
                None
            } else {
                // Sent under the lock so posts cannot interleave with a
                // concurrent standby-to-live drain.
                match self.output_tx.send(message) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(returned)) => Some(returned),
                }
            }
        };

        match refused {
            None => true,
            Some(message) => {
                debug!(
                    session = %self.client_address,
                    id = %message.id(),
                    release_if_not_posted,
                    "refusing to post message"
                );
                if release_if_not_posted {
                    message.release();
                }
                false
            }
        }
    }

    /// Ask the session to shut down.
    ///
    /// Idempotent and safe to call from any mix of initiators. A worker
    /// naming itself as initiator is detached without a stop request (it is
    /// already stopping); any other live worker is asked to stop
    /// asynchronously. The call that observes both workers gone claims the
    /// terminal phase, notifies the server exactly once, and finalizes.
    pub async fn shutdown(&self, initiator: ShutdownInitiator) {
        let destroy = {
            let mut state = self.state.lock();
            match state.phase {
                SessionPhase::Destroyed => return,
                SessionPhase::ShuttingDown => {
                    debug!(
                        session = %self.client_address,
                        initiator = initiator.label(),
                        "shutdown requested again"
                    );
                }
                _ => {
                    info!(
                        session = %self.client_address,
                        initiator = initiator.label(),
                        "session shutting down"
                    );
                    state.phase = SessionPhase::ShuttingDown;
                }
            }

            if initiator == ShutdownInitiator::Input {
                // The input worker is stopping itself; a stop request to it
                // here would be a self-stop.
                state.input = None;
            } else if let Some(input) = &state.input {
                input.cancel.cancel();
            }

            if initiator == ShutdownInitiator::Output {
                state.output = None;
            } else if let Some(output) = &state.output {
                output.cancel.cancel();
            }

            let both_gone = state.input.is_none() && state.output.is_none();
            if both_gone {
                state.phase = SessionPhase::Destroyed;
            }
            both_gone
        };

        if destroy {
            if let Some(server) = self.server.upgrade() {
                server.remove_client_session(self);
            }
            self.finalize().await;
        }
    }

    /// Drain the standby queue into the live output queue in FIFO order.
    /// The caller holds the session lock for the whole transition; this
    /// method takes the held state rather than locking, so the transition
    /// and the drain are one critical section.
    fn move_standby_messages_to_output_queue(&self, state: &mut SessionState) {
        while let Some(message) = state.standby.pop_front() {
            debug!(
                session = %self.client_address,
                id = %message.id(),
                "moving message from standby queue to output queue"
            );
            if let Err(mpsc::error::SendError(returned)) = self.output_tx.send(message) {
                warn!(
                    session = %self.client_address,
                    id = %returned.id(),
                    "output queue gone while draining standby queue, releasing message"
                );
                returned.release();
            }
        }
    }

    /// Complete destruction: wait for attached tasks to drain, release every
    /// message still parked on the standby queue, and tell the listener this
    /// connection ended. Runs exactly once, on the shutdown call that
    /// claimed the terminal phase. (The output worker releases its own
    /// queue's leftovers on the way out.)
    async fn finalize(&self) {
        loop {
            let drained = self.tasks_drained.notified();
            let pending = self.state.lock().tasks.len();
            if pending == 0 {
                break;
            }
            debug!(
                session = %self.client_address,
                pending,
                "waiting for attached tasks before destruction"
            );
            drained.await;
        }

        self.release_standby_messages();

        let notice = self.state.lock().listener.take();
        if let Some(notice) = notice {
            if let Some(listener) = notice.listener.upgrade() {
                listener.connection_ended(notice.socket_id, notice.local_port);
            }
        }

        counter!("hawser_sessions_closed_total").increment(1);
        info!(session = %self.client_address, "session destroyed");
    }

    fn release_standby_messages(&self) {
        let drained: Vec<OutboundMessage> = {
            let mut state = self.state.lock();
            state.standby.drain(..).collect()
        };
        for message in drained {
            debug!(
                session = %self.client_address,
                id = %message.id(),
                "releasing standby message at teardown"
            );
            message.release();
        }
    }

    pub(crate) fn attach_workers(&self, input: WorkerHandle, output: WorkerHandle) {
        let mut state = self.state.lock();
        state.input = Some(input);
        state.output = Some(output);
    }

    pub(crate) fn set_listener_notice(
        &self,
        listener: Weak<Listener>,
        socket_id: SocketId,
        local_port: u16,
    ) {
        self.state.lock().listener = Some(ListenerNotice {
            listener,
            socket_id,
            local_port,
        });
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        // A session dropped without going through shutdown still must not
        // leak standby messages back to their pools' callers.
        let leftover: Vec<OutboundMessage> = self.state.get_mut().standby.drain(..).collect();
        for message in leftover {
            message.release();
        }
    }
}

/// Everything protocol-independent that a connection factory needs to wire a
/// session: the owning server, the message pool, the handler registry, and
/// the wire format.
pub struct SessionWiring {
    /// The server whose collection sessions join and leave.
    pub server: Arc<dyn Server>,
    /// Pool that inbound messages are acquired from.
    pub pool: Arc<MessagePool>,
    /// Registry consulted for every inbound message id.
    pub registry: Arc<HandlerRegistry>,
    /// Framing for this listener's protocol.
    pub wire: Arc<dyn WireFormat>,
}

/// Standard wiring for an accepted connection: create the session, notify
/// the server, split the socket, and spawn the input/output worker pair.
///
/// Returns the session plus the [`ConnectionHandle`] the listener tracks.
/// Cancelling the handle's token stops both workers; the session then runs
/// its normal shutdown protocol.
pub fn spawn_session(
    wiring: &SessionWiring,
    stream: TcpStream,
    peer: SocketAddr,
    listener: Option<&Arc<Listener>>,
) -> (Arc<ClientSession>, ConnectionHandle) {
    let socket_id: SocketId = stream.as_raw_fd();
    let local_port = stream.local_addr().map_or(0, |addr| addr.port());

    let (session, output_rx) = ClientSession::new(&wiring.server, peer);
    wiring.server.add_client_session(&session);
    counter!("hawser_sessions_opened_total").increment(1);

    let conn_cancel = CancellationToken::new();
    let input_cancel = conn_cancel.child_token();
    let output_cancel = conn_cancel.child_token();
    session.attach_workers(
        WorkerHandle {
            cancel: input_cancel.clone(),
        },
        WorkerHandle {
            cancel: output_cancel.clone(),
        },
    );
    if let Some(listener) = listener {
        session.set_listener_notice(Arc::downgrade(listener), socket_id, local_port);
    }

    let (reader, writer) = stream.into_split();
    let input = InputWorker {
        session: Arc::clone(&session),
        server: Arc::clone(&wiring.server),
        pool: Arc::clone(&wiring.pool),
        registry: Arc::clone(&wiring.registry),
        wire: Arc::clone(&wiring.wire),
        reader,
        cancel: input_cancel,
    };
    let output = OutputWorker {
        session: Arc::clone(&session),
        wire: Arc::clone(&wiring.wire),
        writer,
        rx: output_rx,
        cancel: output_cancel,
    };
    drop(tokio::spawn(input.run()));
    drop(tokio::spawn(output.run()));

    let handle = ConnectionHandle {
        socket_id,
        local_port,
        peer_address: session.client_address().to_string(),
        cancel: conn_cancel,
    };
    (session, handle)
}
