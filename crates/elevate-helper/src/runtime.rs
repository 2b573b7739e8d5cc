//! Helper request loop.
//!
//! The broker owns the other end of the channel. The loop answers the
//! handshake with the registered action names, then runs each
//! `ActionRequest` as its own task until the input closes.

use crate::context::HelperContext;
use crate::error::HelperError;
use crate::handler::{ActionHandler, HandlerRegistry};
use elevate_contracts::{
    ActionReply, ActionRequest, Envelope, Frame, FrameCodec, HelloAck, Message, ProtocolError,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MAX_CONCURRENT: usize = 1;

pub struct HelperRuntimeBuilder {
    id: String,
    registry: HandlerRegistry,
    max_concurrent: usize,
}

impl HelperRuntimeBuilder {
    pub fn action(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.registry.register(name, handler);
        self
    }

    /// Requests running at once before new ones are answered HelperBusy.
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn build(self) -> HelperRuntime {
        HelperRuntime {
            id: self.id,
            registry: Arc::new(self.registry),
            max_concurrent: self.max_concurrent,
        }
    }
}

pub struct HelperRuntime {
    id: String,
    registry: Arc<HandlerRegistry>,
    max_concurrent: usize,
}

impl HelperRuntime {
    pub fn builder(id: impl Into<String>) -> HelperRuntimeBuilder {
        HelperRuntimeBuilder {
            id: id.into(),
            registry: HandlerRegistry::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn actions(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Serve the broker over this process's stdin/stdout.
    pub async fn serve_stdio(self) -> Result<(), HelperError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one broker connection until its input closes.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<(), HelperError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let mut sink = FramedWrite::new(writer, FrameCodec::new());

        let first = match frames.next().await {
            Some(frame) => Envelope::try_from(frame?)?,
            None => return Err(HelperError::NoHandshake),
        };
        let hello = match first.message {
            Message::HandshakeRequest(hello) => hello,
            other => {
                return Err(HelperError::UnexpectedFirstMessage(
                    other.message_type().name(),
                ));
            }
        };
        let ack = HelloAck::answer(&hello, &self.id).with_actions(self.registry.names());
        let accepted = ack.accepted;
        sink.send(Envelope::new(first.correlation_id, Message::HandshakeResponse(ack)).into_frame()?)
            .await?;
        if !accepted {
            warn!(
                helper_id = %self.id,
                remote = %hello.version,
                "Rejected broker with incompatible protocol version"
            );
            return Err(ProtocolError::VersionMismatch {
                local: elevate_contracts::PROTOCOL_VERSION,
                remote: hello.version,
            }
            .into());
        }
        info!(helper_id = %self.id, broker = %hello.peer, "Helper ready");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let frame = match envelope.into_bounded_frame(sink.encoder()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "Dropping outbound message");
                        continue;
                    }
                };
                match sink.send(frame).await {
                    Ok(()) => {}
                    Err(ProtocolError::Io(err)) => {
                        warn!(error = %err, "Broker channel closed while writing");
                        break;
                    }
                    Err(err) => warn!(error = %err, "Dropping outbound message"),
                }
            }
        });

        let root = CancellationToken::new();
        let mut in_flight: HashMap<u64, CancellationToken> = HashMap::new();
        let mut tasks: JoinSet<(u64, ActionReply)> = JoinSet::new();

        loop {
            tokio::select! {
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    match done {
                        Ok((correlation_id, reply)) => {
                            // Free the slot before the broker can observe the reply.
                            in_flight.remove(&correlation_id);
                            let _ = outbound.send(Envelope::new(correlation_id, Message::Reply(reply)));
                        }
                        Err(err) => warn!(error = %err, "Request task aborted"),
                    }
                }
                frame = frames.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => {
                            warn!(error = %err, "Unreadable frame from broker, closing");
                            break;
                        }
                        None => {
                            debug!(helper_id = %self.id, "Broker closed input");
                            break;
                        }
                    };
                    self.dispatch(frame, &outbound, &root, &mut in_flight, &mut tasks);
                }
            }
        }

        root.cancel();
        while let Some(done) = tasks.join_next().await {
            if let Ok((correlation_id, reply)) = done {
                let _ = outbound.send(Envelope::new(correlation_id, Message::Reply(reply)));
            }
        }
        drop(outbound);
        let _ = writer_task.await;
        info!(helper_id = %self.id, "Helper stopped");
        Ok(())
    }

    fn dispatch(
        &self,
        frame: Frame,
        outbound: &mpsc::UnboundedSender<Envelope>,
        root: &CancellationToken,
        in_flight: &mut HashMap<u64, CancellationToken>,
        tasks: &mut JoinSet<(u64, ActionReply)>,
    ) {
        let envelope = match Envelope::try_from(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "Dropping undecodable message");
                return;
            }
        };
        let correlation_id = envelope.correlation_id;
        let reply = |reply: ActionReply| {
            let _ = outbound.send(Envelope::new(correlation_id, Message::Reply(reply)));
        };

        match envelope.message {
            Message::ActionRequest(request) => {
                if in_flight.contains_key(&correlation_id) {
                    reply(
                        ActionReply::internal_error()
                            .with_description("duplicate correlation id"),
                    );
                    return;
                }
                if in_flight.len() >= self.max_concurrent {
                    debug!(action = %request.action.name, "Helper busy");
                    reply(ActionReply::helper_busy());
                    return;
                }
                let Some(handler) = self.registry.resolve(&request.action.name) else {
                    debug!(action = %request.action.name, "No handler registered");
                    reply(ActionReply::invalid_action());
                    return;
                };
                let stop = root.child_token();
                in_flight.insert(correlation_id, stop.clone());
                tasks.spawn(run_request(
                    handler,
                    request,
                    correlation_id,
                    outbound.clone(),
                    stop,
                ));
            }
            Message::Cancel => match in_flight.get(&correlation_id) {
                Some(stop) => {
                    debug!(correlation_id, "Stop requested");
                    stop.cancel();
                }
                None => debug!(correlation_id, "Cancel for unknown request"),
            },
            other => {
                warn!(
                    kind = other.message_type().name(),
                    "Unexpected message from broker"
                );
            }
        }
    }
}

async fn run_request(
    handler: Arc<dyn ActionHandler>,
    request: ActionRequest,
    correlation_id: u64,
    outbound: mpsc::UnboundedSender<Envelope>,
    stop: CancellationToken,
) -> (u64, ActionReply) {
    let ActionRequest {
        action,
        caller,
        verification_token,
    } = request;
    let name = action.name.clone();
    let ctx = HelperContext::new(
        action.name,
        correlation_id,
        caller,
        verification_token,
        outbound,
        stop,
    );

    // Run the handler on its own task so a panic becomes a reply.
    let arguments = action.arguments;
    let joined = tokio::spawn(async move { handler.handle(ctx, arguments).await }).await;
    let reply = match joined {
        Ok(reply) => reply,
        Err(err) => {
            warn!(action = %name, error = %err, "Handler panicked");
            ActionReply::internal_error().with_description(format!("handler failed: {err}"))
        }
    };
    debug!(action = %name, status = ?reply.status, "Request finished");
    (correlation_id, reply)
}
