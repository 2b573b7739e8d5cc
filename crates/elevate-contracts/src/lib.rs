//! Elevate Contracts - wire types shared by clients, the broker and helpers.
//!
//! This crate provides the vocabulary every party of the privileged-action
//! protocol agrees on:
//! - [`Action`] and [`ActionReply`], the request and its final result
//! - [`AuthorizationStatus`] and [`RequestState`]
//! - [`Identity`], the credentials of a calling process
//! - [`Frame`] / [`FrameCodec`], the length-prefixed transport framing
//! - [`Envelope`] / [`Message`], the typed payloads carried by frames

pub mod action;
pub mod error;
pub mod frame;
pub mod identity;
pub mod messages;
pub mod reply;
pub mod status;

pub use action::{Action, ActionDetails, ArgumentMap, ExecutionMode, is_valid_action_name};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{Frame, FrameCodec, HEADER_SIZE, MAX_FRAME_SIZE, MessageType};
pub use identity::Identity;
pub use messages::{
    ActionRequest, Envelope, Hello, HelloAck, Message, PROTOCOL_VERSION, PeerRole,
    ProgressUpdate, ProtocolVersion,
};
pub use reply::{ActionReply, ErrorCode, ReplyOrigin, ReplyStatus};
pub use status::{AuthorizationStatus, RequestState};
