use crate::broker::RequestEvent;
use elevate_contracts::{
    Action, ActionReply, ActionRequest, Envelope, FrameCodec, Hello, Message, PeerRole,
    ProtocolError,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

const CLIENT_PEER: &str = concat!("elevate-client/", env!("CARGO_PKG_VERSION"));
const AVAILABILITY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to broker at {path}. Is it running?")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("broker handshake failed: {0}")]
    Handshake(#[from] ProtocolError),

    #[error("connection to the broker was lost")]
    ConnectionLost,
}

#[derive(Default)]
struct RouteTable {
    closed: bool,
    jobs: HashMap<u64, mpsc::UnboundedSender<RequestEvent>>,
}

type Routes = Arc<Mutex<RouteTable>>;

/// Connection to the broker. Several actions can run over it at once.
pub struct BrokerClient {
    broker_peer: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    routes: Routes,
    next_correlation: AtomicU64,
}

impl BrokerClient {
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: socket_path.to_path_buf(),
                source,
            })?;
        let (read, write) = stream.into_split();
        let mut frames = FramedRead::new(read, FrameCodec::new());
        let mut sink = FramedWrite::new(write, FrameCodec::new());

        let hello = Envelope::new(0, Message::HandshakeRequest(Hello::new(PeerRole::Client, CLIENT_PEER)));
        sink.send(hello.into_frame()?).await?;
        let frame = frames.next().await.ok_or(ProtocolError::ConnectionClosed)??;
        let ack = match Envelope::try_from(frame)?.message {
            Message::HandshakeResponse(ack) => ack.into_result()?,
            other => {
                return Err(ProtocolError::UnexpectedMessage(other.message_type().name()).into());
            }
        };
        debug!(broker = %ack.peer, "Connected to broker");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::new(Mutex::new(RouteTable::default()));
        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(frames, routes.clone()));

        Ok(Self {
            broker_peer: ack.peer,
            outbound,
            routes,
            next_correlation: AtomicU64::new(1),
        })
    }

    /// Version string the broker announced.
    pub fn broker_peer(&self) -> &str {
        &self.broker_peer
    }

    /// Submit an action. Its states, progress and reply arrive on the job.
    pub fn execute(&self, action: Action) -> Result<ExecuteJob, ClientError> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock();
            if routes.closed {
                return Err(ClientError::ConnectionLost);
            }
            routes.jobs.insert(correlation_id, tx);
        }
        self.outbound
            .send(Envelope::new(
                correlation_id,
                Message::ActionRequest(ActionRequest::new(action)),
            ))
            .map_err(|_| ClientError::ConnectionLost)?;
        Ok(ExecuteJob {
            correlation_id,
            events: rx,
            outbound: self.outbound.clone(),
            finished: false,
        })
    }

    /// Submit an action and wait for its reply.
    pub async fn execute_and_wait(&self, action: Action) -> Result<ActionReply, ClientError> {
        self.execute(action)?.wait().await
    }
}

/// One submitted action as seen by the client.
pub struct ExecuteJob {
    correlation_id: u64,
    events: mpsc::UnboundedReceiver<RequestEvent>,
    outbound: mpsc::UnboundedSender<Envelope>,
    finished: bool,
}

impl ExecuteJob {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Next state change, progress update or the final reply. Returns
    /// `Ok(None)` after the reply has been handed out.
    pub async fn next_event(&mut self) -> Result<Option<RequestEvent>, ClientError> {
        if self.finished {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(event) => {
                if matches!(event, RequestEvent::Reply(_)) {
                    self.finished = true;
                }
                Ok(Some(event))
            }
            None => Err(ClientError::ConnectionLost),
        }
    }

    /// Ask the broker to cancel. The reply still follows.
    pub fn cancel(&self) -> Result<(), ClientError> {
        self.outbound
            .send(Envelope::new(self.correlation_id, Message::Cancel))
            .map_err(|_| ClientError::ConnectionLost)
    }

    pub async fn wait(mut self) -> Result<ActionReply, ClientError> {
        while let Some(event) = self.next_event().await? {
            if let RequestEvent::Reply(reply) = event {
                return Ok(reply);
            }
        }
        Err(ClientError::ConnectionLost)
    }
}

/// Whether a broker is accepting connections on `socket_path`.
pub async fn is_broker_available(socket_path: &Path) -> bool {
    matches!(
        tokio::time::timeout(AVAILABILITY_TIMEOUT, BrokerClient::connect(socket_path)).await,
        Ok(Ok(_))
    )
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outbound.recv().await {
        let frame = match envelope.into_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Failed to encode message for broker");
                continue;
            }
        };
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut frames: FramedRead<OwnedReadHalf, FrameCodec>, routes: Routes) {
    while let Some(frame) = frames.next().await {
        let envelope = match frame.and_then(Envelope::try_from) {
            Ok(envelope) => envelope,
            Err(err) if err.is_transient() => break,
            Err(err) => {
                warn!(error = %err, "Dropping undecodable broker message");
                continue;
            }
        };
        let correlation_id = envelope.correlation_id;
        let event = match envelope.message {
            Message::StatusChanged(state) => RequestEvent::State(state),
            Message::Progress(update) => RequestEvent::Progress(update),
            Message::Reply(reply) => RequestEvent::Reply(reply),
            other => {
                warn!(kind = other.message_type().name(), "Unexpected message from broker");
                continue;
            }
        };
        let last = matches!(event, RequestEvent::Reply(_));
        let mut routes = routes.lock();
        if let Some(tx) = routes.jobs.get(&correlation_id) {
            let _ = tx.send(event);
        }
        if last {
            routes.jobs.remove(&correlation_id);
        }
    }
    // Dropping the senders tells every waiting job the connection is gone.
    let mut routes = routes.lock();
    routes.closed = true;
    routes.jobs.clear();
}
