//! Broker process plumbing: the client socket, peer credentials, the pid
//! file and signals.

mod ipc_client;
mod ipc_server;
mod peer;
mod process;
mod runner;

pub use ipc_client::{BrokerClient, ClientError, ExecuteJob, is_broker_available};
pub use ipc_server::BrokerServer;
pub use peer::{peer_identity, user_identity};
pub use process::{DaemonStatus, ProcessManager, StartOptions};
pub use runner::BrokerDaemon;
