//! Typed messages carried inside frames.

use crate::action::{Action, ArgumentMap};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{Frame, FrameCodec, MessageType};
use crate::identity::Identity;
use crate::reply::ActionReply;
use crate::status::RequestState;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version spoken by this build. Peers must agree on `major`.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub fn is_compatible_with(self, other: ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Client,
    Broker,
    Helper,
}

/// First message on every connection, sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: ProtocolVersion,
    pub role: PeerRole,
    /// Free-form peer description for logs, e.g. `elevate-cli/0.4.0`.
    pub peer: String,
}

impl Hello {
    pub fn new(role: PeerRole, peer: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            role,
            peer: peer.into(),
        }
    }
}

/// Answer to [`Hello`]. A rejected handshake is followed by connection close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub version: ProtocolVersion,
    pub accepted: bool,
    pub peer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Helpers list the actions their registry resolved at startup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

impl HelloAck {
    pub fn accept(peer: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            accepted: true,
            peer: peer.into(),
            reason: None,
            actions: Vec::new(),
        }
    }

    pub fn reject(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            accepted: false,
            peer: peer.into(),
            reason: Some(reason.into()),
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = actions;
        self
    }

    /// Answer an incoming hello, rejecting a different major version.
    pub fn answer(hello: &Hello, peer: impl Into<String>) -> Self {
        if PROTOCOL_VERSION.is_compatible_with(hello.version) {
            Self::accept(peer)
        } else {
            Self::reject(
                peer,
                format!(
                    "protocol {} is not compatible with {}",
                    hello.version, PROTOCOL_VERSION
                ),
            )
        }
    }

    /// Validate a received answer from the connecting side's point of view.
    pub fn into_result(self) -> ProtocolResult<Self> {
        if !PROTOCOL_VERSION.is_compatible_with(self.version) {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: self.version,
            });
        }
        if !self.accepted {
            return Err(ProtocolError::HandshakeRejected(
                self.reason.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        Ok(self)
    }
}

/// An action submission. Clients leave `caller` empty; the broker fills it
/// from peer credentials before forwarding to a helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
}

impl ActionRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            caller: None,
            verification_token: None,
        }
    }
}

/// Progress reported by a helper, passed through to the client unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProgressUpdate {
    Percent(u32),
    Data(ArgumentMap),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    HandshakeRequest(Hello),
    HandshakeResponse(HelloAck),
    ActionRequest(ActionRequest),
    Progress(ProgressUpdate),
    Reply(ActionReply),
    Cancel,
    StatusChanged(RequestState),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::HandshakeRequest(_) => MessageType::HandshakeRequest,
            Self::HandshakeResponse(_) => MessageType::HandshakeResponse,
            Self::ActionRequest(_) => MessageType::ActionRequest,
            Self::Progress(_) => MessageType::Progress,
            Self::Reply(_) => MessageType::Reply,
            Self::Cancel => MessageType::Cancel,
            Self::StatusChanged(_) => MessageType::StatusChanged,
        }
    }
}

/// A message together with the request it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub correlation_id: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(correlation_id: u64, message: Message) -> Self {
        Self {
            correlation_id,
            message,
        }
    }

    pub fn into_frame(self) -> ProtocolResult<Frame> {
        let message_type = self.message.message_type();
        let payload = match &self.message {
            Message::HandshakeRequest(hello) => to_payload(message_type, hello)?,
            Message::HandshakeResponse(ack) => to_payload(message_type, ack)?,
            Message::ActionRequest(request) => to_payload(message_type, request)?,
            Message::Progress(update) => to_payload(message_type, update)?,
            Message::Reply(reply) => to_payload(message_type, reply)?,
            Message::Cancel => Bytes::new(),
            Message::StatusChanged(state) => to_payload(message_type, state)?,
        };
        Ok(Frame::new(message_type, self.correlation_id, payload))
    }

    /// Encode for a peer that accepts frames up to `codec`'s limit.
    ///
    /// A reply too large to send is swapped for an `InternalError` reply on
    /// the same correlation id, so whoever waits on it still gets an answer.
    /// Other oversized messages fail with `FrameTooLarge`.
    pub fn into_bounded_frame(self, codec: &FrameCodec) -> ProtocolResult<Frame> {
        let correlation_id = self.correlation_id;
        let is_reply = matches!(self.message, Message::Reply(_));
        let frame = self.into_frame()?;
        match codec.check(&frame) {
            Ok(()) => Ok(frame),
            Err(err) if is_reply => {
                let reply = ActionReply::internal_error()
                    .with_description(format!("reply could not be delivered: {err}"));
                Envelope::new(correlation_id, Message::Reply(reply)).into_frame()
            }
            Err(err) => Err(err),
        }
    }
}

impl TryFrom<Frame> for Envelope {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> ProtocolResult<Self> {
        let kind = frame.message_type;
        let message = match kind {
            MessageType::HandshakeRequest => Message::HandshakeRequest(from_payload(kind, &frame)?),
            MessageType::HandshakeResponse => {
                Message::HandshakeResponse(from_payload(kind, &frame)?)
            }
            MessageType::ActionRequest => Message::ActionRequest(from_payload(kind, &frame)?),
            MessageType::Progress => Message::Progress(from_payload(kind, &frame)?),
            MessageType::Reply => Message::Reply(from_payload(kind, &frame)?),
            MessageType::Cancel => Message::Cancel,
            MessageType::StatusChanged => Message::StatusChanged(from_payload(kind, &frame)?),
        };
        Ok(Envelope::new(frame.correlation_id, message))
    }
}

fn to_payload<T: Serialize>(kind: MessageType, value: &T) -> ProtocolResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| ProtocolError::InvalidPayload {
            kind: kind.name(),
            source,
        })
}

fn from_payload<T: DeserializeOwned>(kind: MessageType, frame: &Frame) -> ProtocolResult<T> {
    serde_json::from_slice(&frame.payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.name(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::{ErrorCode, ReplyStatus};
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    fn wire_round_trip(envelope: Envelope) -> Envelope {
        let mut buf = BytesMut::new();
        let mut codec = FrameCodec::new();
        codec.encode(envelope.into_frame().unwrap(), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        Envelope::try_from(frame).unwrap()
    }

    #[test]
    fn test_action_request_survives_the_wire() {
        let action = Action::new("org.example.write")
            .with_helper("org.example.helper")
            .with_argument("path", "/etc/x")
            .with_argument("mode", 0o644);
        let mut request = ActionRequest::new(action);
        request.caller = Some(Identity::new(1000, 1000).with_groups(["wheel"]));
        let envelope = Envelope::new(42, Message::ActionRequest(request));

        assert_eq!(wire_round_trip(envelope.clone()), envelope);
    }

    #[test]
    fn test_progress_survives_the_wire() {
        let percent = Envelope::new(5, Message::Progress(ProgressUpdate::Percent(40)));
        assert_eq!(wire_round_trip(percent.clone()), percent);

        let mut data = ArgumentMap::new();
        data.insert("file".to_string(), serde_json::json!("/etc/hosts"));
        let data = Envelope::new(5, Message::Progress(ProgressUpdate::Data(data)));
        assert_eq!(wire_round_trip(data.clone()), data);
    }

    #[test]
    fn test_reply_survives_the_wire() {
        let reply = ActionReply::helper_error(3)
            .with_description("permission denied")
            .with_data("path", "/etc/x");
        let envelope = Envelope::new(9, Message::Reply(reply));
        assert_eq!(wire_round_trip(envelope.clone()), envelope);
    }

    #[test]
    fn test_cancel_has_empty_payload() {
        let frame = Envelope::new(3, Message::Cancel).into_frame().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(Envelope::try_from(frame).unwrap().message, Message::Cancel);
    }

    #[test]
    fn test_handshake_major_mismatch_is_rejected() {
        let mut hello = Hello::new(PeerRole::Client, "test/1");
        hello.version = ProtocolVersion {
            major: PROTOCOL_VERSION.major + 1,
            minor: 0,
        };
        let ack = HelloAck::answer(&hello, "broker");
        assert!(!ack.accepted);
        assert!(matches!(
            ack.into_result(),
            Err(ProtocolError::HandshakeRejected(_))
        ));
    }

    #[test]
    fn test_handshake_minor_difference_is_accepted() {
        let mut hello = Hello::new(PeerRole::Broker, "broker");
        hello.version.minor += 3;
        assert!(HelloAck::answer(&hello, "helper").into_result().is_ok());
    }

    #[test]
    fn test_ack_from_newer_major_is_a_version_mismatch() {
        let mut ack = HelloAck::accept("future-broker");
        ack.version.major += 1;
        assert!(matches!(
            ack.into_result(),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_is_reported_with_its_kind() {
        let frame = Frame::new(MessageType::Reply, 1, Bytes::from_static(b"not json"));
        let err = Envelope::try_from(frame).unwrap_err();
        assert!(err.to_string().contains("reply"));
    }

    #[test]
    fn test_oversized_reply_becomes_internal_error() {
        let codec = FrameCodec::with_max_frame_size(512);
        let reply = ActionReply::success().with_data("blob", "x".repeat(1024));
        let frame = Envelope::new(11, Message::Reply(reply))
            .into_bounded_frame(&codec)
            .unwrap();

        assert!(codec.check(&frame).is_ok());
        let envelope = Envelope::try_from(frame).unwrap();
        assert_eq!(envelope.correlation_id, 11);
        match envelope.message {
            Message::Reply(reply) => {
                assert_eq!(reply.status, ReplyStatus::Failed);
                assert_eq!(reply.error(), Some(ErrorCode::InternalError));
                assert!(reply.error_description.unwrap().contains("exceeds"));
            }
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_request_is_refused() {
        let codec = FrameCodec::with_max_frame_size(256);
        let action = Action::new("org.example.write").with_argument("blob", "x".repeat(1024));
        let err = Envelope::new(2, Message::ActionRequest(ActionRequest::new(action)))
            .into_bounded_frame(&codec)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 256, .. }));

        let small = Envelope::new(2, Message::Progress(ProgressUpdate::Percent(5)));
        assert!(small.into_bounded_frame(&codec).is_ok());
    }
}
