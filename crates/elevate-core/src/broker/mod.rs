//! Per-request state machine: policy check, authentication, dispatch.

mod coordinator;
mod request;

pub use coordinator::{Broker, BrokerBuilder, BrokerStatus};
pub use request::{RequestEvent, RequestHandle, RequestSummary};
