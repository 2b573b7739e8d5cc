//! One running helper and the requests multiplexed over its channel.

use super::error::LaunchError;
use super::spawner::{BoxedReader, BoxedWriter, HelperChannel, HelperProcess};
use crate::BROKER_PEER;
use crate::registry::HelperManifest;
use elevate_contracts::{
    ActionReply, ActionRequest, Envelope, Frame, FrameCodec, Hello, HelloAck, Message, PeerRole,
    ProgressUpdate, ProtocolError, ProtocolResult,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a helper sent back for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress(ProgressUpdate),
    Reply(ActionReply),
}

struct Usage {
    in_flight: usize,
    idle_since: Instant,
}

pub struct HelperSession {
    helper_id: String,
    pid: Option<u32>,
    actions: Vec<String>,
    idle_timeout: Duration,
    started_at: Instant,
    codec: FrameCodec,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<SessionEvent>>>,
    next_correlation: AtomicU64,
    usage: Mutex<Usage>,
    closed: CancellationToken,
    stop_writer: CancellationToken,
    process: Mutex<Option<Box<dyn HelperProcess>>>,
}

impl HelperSession {
    /// Handshake with a freshly spawned helper and start its I/O tasks.
    /// On failure the process is killed.
    pub async fn establish(
        manifest: &HelperManifest,
        channel: HelperChannel,
        handshake_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Arc<Self>, LaunchError> {
        let HelperChannel {
            reader,
            writer,
            mut process,
        } = channel;
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let mut sink = FramedWrite::new(writer, FrameCodec::new());

        let ack = match tokio::time::timeout(handshake_timeout, handshake(&mut frames, &mut sink))
            .await
        {
            Ok(Ok(ack)) => ack,
            Ok(Err(err)) => {
                process.terminate(Duration::ZERO).await;
                return Err(LaunchError::Handshake {
                    helper_id: manifest.id.clone(),
                    reason: err.to_string(),
                    transient: err.is_transient(),
                });
            }
            Err(_) => {
                process.terminate(Duration::ZERO).await;
                return Err(LaunchError::HandshakeTimeout {
                    helper_id: manifest.id.clone(),
                });
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let stop_writer = CancellationToken::new();
        let session = Arc::new(Self {
            helper_id: manifest.id.clone(),
            pid: process.id(),
            actions: ack.actions,
            idle_timeout,
            started_at: Instant::now(),
            codec: FrameCodec::new(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            usage: Mutex::new(Usage {
                in_flight: 0,
                idle_since: Instant::now(),
            }),
            closed: CancellationToken::new(),
            stop_writer: stop_writer.clone(),
            process: Mutex::new(Some(process)),
        });

        tokio::spawn(write_loop(
            manifest.id.clone(),
            sink,
            outbound_rx,
            stop_writer,
        ));
        tokio::spawn(read_loop(frames, Arc::downgrade(&session)));

        info!(
            helper_id = %session.helper_id,
            pid = ?session.pid,
            helper = %ack.peer,
            "Helper session ready"
        );
        Ok(session)
    }

    pub fn helper_id(&self) -> &str {
        &self.helper_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Actions the helper announced in its handshake.
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Resolves once the helper's channel has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn in_flight(&self) -> usize {
        self.usage.lock().in_flight
    }

    /// Time since the last lease was released, if none is held.
    pub fn idle_for(&self) -> Option<Duration> {
        let usage = self.usage.lock();
        (usage.in_flight == 0).then(|| usage.idle_since.elapsed())
    }

    pub fn lease(self: &Arc<Self>) -> HelperLease {
        self.usage.lock().in_flight += 1;
        HelperLease {
            session: self.clone(),
        }
    }

    fn release(&self) {
        let mut usage = self.usage.lock();
        usage.in_flight = usage.in_flight.saturating_sub(1);
        if usage.in_flight == 0 {
            usage.idle_since = Instant::now();
        }
    }

    /// Forward a request. If the helper is already gone the returned
    /// request yields `HelperCrashed` immediately; a request too large for
    /// the helper channel yields `InternalError` and never reaches it.
    pub fn dispatch(self: &Arc<Self>, request: ActionRequest) -> DispatchedRequest {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        match Envelope::new(correlation_id, Message::ActionRequest(request))
            .into_bounded_frame(&self.codec)
        {
            Ok(frame) => {
                let mut pending = self.pending.lock();
                if self.closed.is_cancelled() {
                    let _ = tx.send(SessionEvent::Reply(ActionReply::helper_crashed()));
                } else {
                    pending.insert(correlation_id, tx);
                    let _ = self.outbound.send(frame);
                }
                debug!(helper_id = %self.helper_id, correlation_id, "Dispatched request to helper");
            }
            Err(err) => {
                warn!(
                    helper_id = %self.helper_id,
                    correlation_id,
                    error = %err,
                    "Request cannot be sent to helper"
                );
                let reply = ActionReply::internal_error()
                    .with_description(format!("request could not be sent to the helper: {err}"));
                let _ = tx.send(SessionEvent::Reply(reply));
            }
        }
        DispatchedRequest {
            correlation_id,
            events: rx,
            session: self.clone(),
        }
    }

    fn cancel(&self, correlation_id: u64) {
        if self.pending.lock().remove(&correlation_id).is_some()
            && let Ok(frame) = Envelope::new(correlation_id, Message::Cancel).into_frame()
        {
            let _ = self.outbound.send(frame);
        }
    }

    fn forget(&self, correlation_id: u64) {
        self.pending.lock().remove(&correlation_id);
    }

    fn route(&self, envelope: Envelope) {
        let correlation_id = envelope.correlation_id;
        match envelope.message {
            Message::Progress(update) => {
                if let Some(tx) = self.pending.lock().get(&correlation_id) {
                    let _ = tx.send(SessionEvent::Progress(update));
                }
            }
            Message::Reply(reply) => match self.pending.lock().remove(&correlation_id) {
                Some(tx) => {
                    let _ = tx.send(SessionEvent::Reply(reply));
                }
                None => debug!(
                    helper_id = %self.helper_id,
                    correlation_id,
                    "Dropping reply for a request nobody waits on"
                ),
            },
            other => warn!(
                helper_id = %self.helper_id,
                kind = other.message_type().name(),
                "Unexpected message from helper"
            ),
        }
    }

    fn mark_closed(&self) {
        let orphans: Vec<_> = {
            let mut pending = self.pending.lock();
            self.closed.cancel();
            pending.drain().collect()
        };
        if orphans.is_empty() {
            info!(helper_id = %self.helper_id, "Helper channel closed");
        } else {
            warn!(
                helper_id = %self.helper_id,
                requests = orphans.len(),
                "Helper exited with requests in flight"
            );
        }
        for (_, tx) in orphans {
            let _ = tx.send(SessionEvent::Reply(ActionReply::helper_crashed()));
        }
    }

    /// Close the helper's input and stop its process.
    pub async fn terminate(&self, grace: Duration) {
        self.stop_writer.cancel();
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            debug!(helper_id = %self.helper_id, "Terminating helper");
            process.terminate(grace).await;
        }
    }
}

/// Keeps a session counted as busy. Dropping the lease releases it.
pub struct HelperLease {
    session: Arc<HelperSession>,
}

impl HelperLease {
    pub fn session(&self) -> &Arc<HelperSession> {
        &self.session
    }

    pub fn dispatch(&self, request: ActionRequest) -> DispatchedRequest {
        self.session.dispatch(request)
    }
}

impl Drop for HelperLease {
    fn drop(&mut self) {
        self.session.release();
    }
}

/// A request in flight on a helper. Dropping it discards any late reply.
pub struct DispatchedRequest {
    correlation_id: u64,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    session: Arc<HelperSession>,
}

impl DispatchedRequest {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Ask the helper to stop. Whatever it answers is dropped.
    pub fn cancel(&self) {
        self.session.cancel(self.correlation_id);
    }
}

impl Drop for DispatchedRequest {
    fn drop(&mut self) {
        self.session.forget(self.correlation_id);
    }
}

async fn handshake(
    frames: &mut FramedRead<BoxedReader, FrameCodec>,
    sink: &mut FramedWrite<BoxedWriter, FrameCodec>,
) -> ProtocolResult<HelloAck> {
    let hello = Envelope::new(
        0,
        Message::HandshakeRequest(Hello::new(PeerRole::Broker, BROKER_PEER)),
    );
    sink.send(hello.into_frame()?).await?;

    let frame = frames.next().await.ok_or(ProtocolError::ConnectionClosed)??;
    match Envelope::try_from(frame)?.message {
        Message::HandshakeResponse(ack) => ack.into_result(),
        other => Err(ProtocolError::UnexpectedMessage(
            other.message_type().name(),
        )),
    }
}

async fn write_loop(
    helper_id: String,
    mut sink: FramedWrite<BoxedWriter, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match sink.send(frame).await {
                    Ok(()) => {}
                    Err(ProtocolError::Io(err)) => {
                        debug!(helper_id = %helper_id, error = %err, "Helper channel closed while writing");
                        break;
                    }
                    Err(err) => {
                        warn!(helper_id = %helper_id, error = %err, "Dropping message for helper");
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut frames: FramedRead<BoxedReader, FrameCodec>, session: Weak<HelperSession>) {
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Unreadable frame from helper, closing session");
                break;
            }
        };
        let envelope = match Envelope::try_from(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "Dropping undecodable helper message");
                continue;
            }
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        session.route(envelope);
    }
    if let Some(session) = session.upgrade() {
        session.mark_closed();
    }
}
