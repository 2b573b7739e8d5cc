//! Per-request context handed to action handlers.

use elevate_contracts::{ArgumentMap, Envelope, Identity, Message, ProgressUpdate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a handler may know about, or report for, the request it runs.
///
/// Progress is queued on the helper's single outbound channel, so updates
/// reach the broker in the order the handler emitted them.
#[derive(Clone)]
pub struct HelperContext {
    action: String,
    correlation_id: u64,
    caller: Option<Identity>,
    verification_token: Option<String>,
    outbound: mpsc::UnboundedSender<Envelope>,
    stop: CancellationToken,
}

impl HelperContext {
    pub(crate) fn new(
        action: String,
        correlation_id: u64,
        caller: Option<Identity>,
        verification_token: Option<String>,
        outbound: mpsc::UnboundedSender<Envelope>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            action,
            correlation_id,
            caller,
            verification_token,
            outbound,
            stop,
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn caller(&self) -> Option<&Identity> {
        self.caller.as_ref()
    }

    pub fn caller_uid(&self) -> Option<u32> {
        self.caller.as_ref().map(|caller| caller.uid)
    }

    /// Token issued by the broker's authentication agent, when the policy
    /// required one.
    pub fn verification_token(&self) -> Option<&str> {
        self.verification_token.as_deref()
    }

    /// Report a percentage step.
    pub fn progress_step(&self, step: u32) {
        self.send_progress(ProgressUpdate::Percent(step));
    }

    /// Report structured progress data.
    pub fn progress_data(&self, data: ArgumentMap) {
        self.send_progress(ProgressUpdate::Data(data));
    }

    /// Whether the client asked to stop this request. Cancellation is
    /// advisory: handlers decide where it is safe to abort.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once a stop was requested.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    fn send_progress(&self, update: ProgressUpdate) {
        if self.is_stopped() {
            debug!(action = %self.action, "Dropping progress for stopped request");
            return;
        }
        let _ = self.outbound.send(Envelope::new(
            self.correlation_id,
            Message::Progress(update),
        ));
    }
}
