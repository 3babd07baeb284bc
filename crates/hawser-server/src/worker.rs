//! The per-session I/O worker pair.
//!
//! Every accepted connection gets one input worker (reads bytes, decodes
//! frames, dispatches handlers) and one output worker (drains the session's
//! output queue onto the socket). Each worker runs until its cancellation
//! token fires or its half of the socket fails, then requests shutdown of
//! its own session naming itself as initiator, which is what lets the
//! session detach it without a stop request.

use std::sync::Arc;

use bytes::BytesMut;
use hawser_core::{Frame, FrameError, MessagePool, WireFormat};
use metrics::counter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::HandlerRegistry;
use crate::server::Server;
use crate::session::{ClientSession, OutboundMessage, ShutdownInitiator};

const READ_CHUNK: usize = 8 * 1024;

/// Why an input worker's read loop ended.
enum ReadEnd {
    /// The worker's cancellation token fired.
    Cancelled,
    /// The client closed the connection on a frame boundary.
    Eof,
    /// The byte stream is unusable: framing violation, truncation, or a
    /// socket error.
    Failed(FrameError),
    /// A handler failed; the failure is fatal to this connection.
    Handler(crate::handler::HandlerError),
}

pub(crate) struct InputWorker {
    pub(crate) session: Arc<ClientSession>,
    pub(crate) server: Arc<dyn Server>,
    pub(crate) pool: Arc<MessagePool>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) wire: Arc<dyn WireFormat>,
    pub(crate) reader: OwnedReadHalf,
    pub(crate) cancel: CancellationToken,
}

impl InputWorker {
    pub(crate) async fn run(mut self) {
        let end = self.read_loop().await;
        match end {
            ReadEnd::Cancelled => {
                debug!(session = %self.session.client_address(), "input worker stopped");
            }
            ReadEnd::Eof => {
                debug!(session = %self.session.client_address(), "client closed connection");
                self.session.set_client_going_offline();
            }
            ReadEnd::Failed(err) => {
                warn!(
                    session = %self.session.client_address(),
                    error = %err,
                    "input worker ending on stream error"
                );
            }
            ReadEnd::Handler(err) => {
                warn!(
                    session = %self.session.client_address(),
                    error = %err,
                    "input worker ending on handler failure"
                );
            }
        }
        self.session.shutdown(ShutdownInitiator::Input).await;
    }

    async fn read_loop(&mut self) -> ReadEnd {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            // Drain every complete frame already buffered before blocking on
            // the socket again.
            loop {
                match self.wire.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        if let Err(err) = self.handle_frame(frame).await {
                            return ReadEnd::Handler(err);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return ReadEnd::Failed(err),
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return ReadEnd::Cancelled,
                read = self.reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        if buf.is_empty() {
                            return ReadEnd::Eof;
                        }
                        return ReadEnd::Failed(FrameError::Truncated { buffered: buf.len() });
                    }
                    Ok(_) => {}
                    Err(err) => return ReadEnd::Failed(FrameError::Io(err)),
                },
            }
        }
    }

    /// Turn one decoded frame into a pooled message and dispatch it. A
    /// handler failure is fatal to the connection; an unregistered id is
    /// not.
    async fn handle_frame(&self, frame: Frame) -> Result<(), crate::handler::HandlerError> {
        let mut message = self.pool.acquire(frame.id);
        message.body_mut().extend_from_slice(&frame.payload);

        match self
            .registry
            .dispatch(&message, self.session.client_address())
        {
            Some(dispatched) => {
                dispatched
                    .process(
                        Arc::clone(&self.server),
                        Some(Arc::clone(&self.session)),
                        message,
                    )
                    .await?;
            }
            None => {
                warn!(
                    session = %self.session.client_address(),
                    id = %message.id(),
                    "no handler registered, discarding message"
                );
                counter!("hawser_dispatch_unhandled_total").increment(1);
                message.release();
            }
        }
        Ok(())
    }
}

pub(crate) struct OutputWorker {
    pub(crate) session: Arc<ClientSession>,
    pub(crate) wire: Arc<dyn WireFormat>,
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) rx: mpsc::UnboundedReceiver<OutboundMessage>,
    pub(crate) cancel: CancellationToken,
}

impl OutputWorker {
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(session = %self.session.client_address(), "output worker stopped");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(message) => {
                        if !self.write_message(message).await {
                            break;
                        }
                    }
                    // Sender gone means the session itself is being dropped.
                    None => break,
                },
            }
        }

        // Nothing posted after this point is accepted by the session, but
        // messages already queued must still reach their pools.
        self.rx.close();
        while let Ok(leftover) = self.rx.try_recv() {
            debug!(
                session = %self.session.client_address(),
                id = %leftover.id(),
                "releasing queued message at output teardown"
            );
            leftover.release();
        }
        self.session.shutdown(ShutdownInitiator::Output).await;
    }

    /// Encode and write one message, releasing it afterward. Returns `false`
    /// when the socket is no longer usable.
    async fn write_message(&mut self, message: OutboundMessage) -> bool {
        let mut scratch = BytesMut::new();
        let encoded = match &message {
            OutboundMessage::Unique(m) => self.wire.encode(m, &mut scratch),
            // The shared read guard must not be held across the write await;
            // encoding into the scratch buffer keeps it scoped to this arm.
            OutboundMessage::Shared(s) => self.wire.encode(&s.read(), &mut scratch),
        };
        let id = message.id();
        message.release();

        if let Err(err) = encoded {
            warn!(
                session = %self.session.client_address(),
                id = %id,
                error = %err,
                "dropping unencodable outbound message"
            );
            return true;
        }

        match self.write_all(&scratch).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    session = %self.session.client_address(),
                    id = %id,
                    error = %err,
                    "output worker ending on write error"
                );
                false
            }
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }
}
