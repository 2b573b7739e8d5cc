//! Helper process lifecycle: spawning, handshakes, reuse and reaping.

pub mod error;
pub mod launcher;
pub mod session;
pub mod spawner;

pub use error::LaunchError;
pub use launcher::{HelperLauncher, HelperState, HelperStatus, LauncherConfig};
pub use session::{DispatchedRequest, HelperLease, HelperSession, SessionEvent};
pub use spawner::{
    BoxedReader, BoxedWriter, HelperChannel, HelperProcess, HelperSpawner, ProcessSpawner,
};
