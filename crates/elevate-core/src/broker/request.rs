use elevate_contracts::{Action, ActionReply, Identity, ProgressUpdate, RequestState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Something the broker reports about a submitted request, in order.
/// The reply is always the last event.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    State(RequestState),
    Progress(ProgressUpdate),
    Reply(ActionReply),
}

/// Everything a request produced, collected by [`RequestHandle::finish`].
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub states: Vec<RequestState>,
    pub progress: Vec<ProgressUpdate>,
    pub reply: ActionReply,
}

/// Client side of a submitted request.
pub struct RequestHandle {
    id: Uuid,
    events: mpsc::UnboundedReceiver<RequestEvent>,
    cancel: CancellationToken,
}

impl RequestHandle {
    pub(crate) fn new(
        id: Uuid,
        events: mpsc::UnboundedReceiver<RequestEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, events, cancel }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation. Past dispatch this is advisory: the helper is
    /// asked to stop but the request reports Cancelled right away.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn next_event(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    /// Wait for the reply, discarding states and progress.
    pub async fn wait(self) -> ActionReply {
        self.finish().await.reply
    }

    pub async fn finish(mut self) -> RequestSummary {
        let mut states = Vec::new();
        let mut progress = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                RequestEvent::State(state) => states.push(state),
                RequestEvent::Progress(update) => progress.push(update),
                RequestEvent::Reply(reply) => {
                    return RequestSummary {
                        states,
                        progress,
                        reply,
                    };
                }
            }
        }
        RequestSummary {
            states,
            progress,
            reply: ActionReply::internal_error().with_description("request ended without a reply"),
        }
    }
}

/// Broker side of a request: the action, who asked for it and where its
/// events go. Consumed when the reply is delivered.
pub(crate) struct PendingRequest {
    pub id: Uuid,
    pub identity: Identity,
    pub action: Action,
    pub cancel: CancellationToken,
    state: RequestState,
    events: mpsc::UnboundedSender<RequestEvent>,
}

impl PendingRequest {
    pub fn new(
        id: Uuid,
        identity: Identity,
        action: Action,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<RequestEvent>,
    ) -> Self {
        let request = Self {
            id,
            identity,
            action,
            cancel,
            state: RequestState::Received,
            events,
        };
        request.emit(RequestEvent::State(RequestState::Received));
        request
    }

    pub fn transition(&mut self, state: RequestState) {
        debug!(
            request_id = %self.id,
            action = %self.action.name,
            from = %self.state,
            to = %state,
            "Request state changed"
        );
        self.state = state;
        self.emit(RequestEvent::State(state));
    }

    pub fn progress(&self, update: ProgressUpdate) {
        self.emit(RequestEvent::Progress(update));
    }

    pub fn finish(mut self, state: RequestState, reply: ActionReply) {
        self.transition(state);
        info!(
            request_id = %self.id,
            action = %self.action.name,
            uid = self.identity.uid,
            state = %state,
            error_code = reply.error_code,
            "Request finished"
        );
        self.emit(RequestEvent::Reply(reply));
    }

    fn emit(&self, event: RequestEvent) {
        // The client may already be gone.
        let _ = self.events.send(event);
    }
}
