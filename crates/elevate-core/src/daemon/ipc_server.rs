use super::peer::peer_identity;
use crate::BROKER_PEER;
use crate::broker::{Broker, RequestEvent, RequestHandle};
use anyhow::{Context, Result};
use elevate_contracts::{
    Envelope, FrameCodec, HelloAck, Identity, Message, PeerRole, ProtocolError,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Client-facing Unix socket of the broker.
pub struct BrokerServer {
    broker: Arc<Broker>,
    socket_path: PathBuf,
    listener: UnixListener,
}

impl BrokerServer {
    /// Bind the socket, replacing a stale one. Any local user may connect;
    /// the broker authorizes each request from the peer's credentials.
    pub fn bind(broker: Arc<Broker>, socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))?;
        }

        info!(path = %socket_path.display(), "Broker socket listening");
        Ok(Self {
            broker,
            socket_path,
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept clients until `shutdown` fires, then remove the socket.
    /// Connections already open keep running so their requests can drain.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let broker = self.broker.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_client(stream, broker).await {
                                    debug!(error = %err, "Client disconnected");
                                }
                            });
                        }
                        Err(err) => error!(error = %err, "Broker accept error"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Broker socket closing");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn handle_client(stream: UnixStream, broker: Arc<Broker>) -> Result<()> {
    let identity = peer_identity(&stream).context("Failed to read peer credentials")?;
    let (read, write) = stream.into_split();
    let mut frames = FramedRead::new(read, FrameCodec::new());
    let mut sink = FramedWrite::new(write, FrameCodec::new());

    tokio::time::timeout(
        broker.config().handshake_timeout(),
        accept_handshake(&mut frames, &mut sink),
    )
    .await
    .context("Client did not complete the handshake in time")??;
    debug!(uid = identity.uid, pid = ?identity.pid, "Client connected");

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outbound_rx));

    let mut active: HashMap<u64, CancellationToken> = HashMap::new();
    let mut forwarders: JoinSet<u64> = JoinSet::new();

    loop {
        tokio::select! {
            Some(done) = forwarders.join_next(), if !forwarders.is_empty() => {
                if let Ok(correlation_id) = done {
                    active.remove(&correlation_id);
                }
            }
            frame = frames.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        warn!(uid = identity.uid, error = %err, "Unreadable frame from client");
                        break;
                    }
                    None => break,
                };
                match Envelope::try_from(frame) {
                    Ok(envelope) => handle_message(
                        &broker,
                        &identity,
                        envelope,
                        &outbound,
                        &mut active,
                        &mut forwarders,
                    ),
                    Err(err) => warn!(uid = identity.uid, error = %err, "Dropping undecodable client message"),
                }
            }
        }
    }

    if !active.is_empty() {
        info!(
            uid = identity.uid,
            requests = active.len(),
            "Client went away, cancelling its requests"
        );
    }
    for cancel in active.values() {
        cancel.cancel();
    }
    forwarders.abort_all();
    drop(outbound);
    let _ = writer.await;
    Ok(())
}

fn handle_message(
    broker: &Arc<Broker>,
    identity: &Identity,
    envelope: Envelope,
    outbound: &mpsc::UnboundedSender<Envelope>,
    active: &mut HashMap<u64, CancellationToken>,
    forwarders: &mut JoinSet<u64>,
) {
    let correlation_id = envelope.correlation_id;
    match envelope.message {
        Message::ActionRequest(request) => {
            // Answering on a live id would end the request already using it.
            if active.contains_key(&correlation_id) {
                warn!(
                    uid = identity.uid,
                    correlation_id,
                    "Dropping request that reuses a live correlation id"
                );
                return;
            }
            // The caller field is the client's claim; the broker uses the
            // socket credentials instead.
            let handle = broker.submit(identity.clone(), request.action);
            active.insert(correlation_id, handle.cancel_token());
            forwarders.spawn(forward_events(correlation_id, handle, outbound.clone()));
        }
        Message::Cancel => match active.get(&correlation_id) {
            Some(cancel) => {
                debug!(correlation_id, "Client cancelled request");
                cancel.cancel();
            }
            None => debug!(correlation_id, "Cancel for unknown request"),
        },
        other => warn!(
            uid = identity.uid,
            kind = other.message_type().name(),
            "Unexpected message from client"
        ),
    }
}

async fn forward_events(
    correlation_id: u64,
    mut handle: RequestHandle,
    outbound: mpsc::UnboundedSender<Envelope>,
) -> u64 {
    while let Some(event) = handle.next_event().await {
        let (message, last) = match event {
            RequestEvent::State(state) => (Message::StatusChanged(state), false),
            RequestEvent::Progress(update) => (Message::Progress(update), false),
            RequestEvent::Reply(reply) => (Message::Reply(reply), true),
        };
        if outbound.send(Envelope::new(correlation_id, message)).is_err() || last {
            break;
        }
    }
    correlation_id
}

async fn accept_handshake(
    frames: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    sink: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
) -> Result<(), ProtocolError> {
    let frame = frames.next().await.ok_or(ProtocolError::ConnectionClosed)??;
    let envelope = Envelope::try_from(frame)?;
    let hello = match envelope.message {
        Message::HandshakeRequest(hello) => hello,
        other => {
            return Err(ProtocolError::UnexpectedMessage(
                other.message_type().name(),
            ));
        }
    };
    let ack = if hello.role == PeerRole::Client {
        HelloAck::answer(&hello, BROKER_PEER)
    } else {
        HelloAck::reject(BROKER_PEER, "only clients may connect to the broker")
    };
    let accepted = ack.accepted;
    let reason = ack.reason.clone();
    sink.send(Envelope::new(envelope.correlation_id, Message::HandshakeResponse(ack)).into_frame()?)
        .await?;
    if accepted {
        Ok(())
    } else {
        Err(ProtocolError::HandshakeRejected(
            reason.unwrap_or_else(|| "rejected".to_string()),
        ))
    }
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outbound.recv().await {
        let frame = match envelope.into_bounded_frame(sink.encoder()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Dropping message for client");
                continue;
            }
        };
        match sink.send(frame).await {
            Ok(()) => {}
            Err(ProtocolError::Io(_)) => break,
            Err(err) => warn!(error = %err, "Dropping message for client"),
        }
    }
    let _ = sink.close().await;
}
