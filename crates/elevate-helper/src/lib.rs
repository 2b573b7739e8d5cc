//! Helper-side support for elevate privileged actions.
//!
//! A helper is a small executable the broker spawns with elevated rights.
//! It registers one handler per action name at startup and then serves the
//! broker over its stdin/stdout:
//!
//! ```ignore
//! use elevate_helper::{HelperRuntime, handler_fn};
//! use elevate_contracts::ActionReply;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = HelperRuntime::builder("org.example.helper")
//!         .action("org.example.write", handler_fn(|ctx, args| async move {
//!             ctx.progress_step(50);
//!             ActionReply::success()
//!         }))
//!         .build();
//!     elevate_helper::helper_main(runtime).await?;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod handler;
pub mod logging;
pub mod runtime;

pub use context::HelperContext;
pub use error::HelperError;
pub use handler::{ActionHandler, HandlerRegistry, handler_fn};
pub use logging::init_helper_tracing;
pub use runtime::{HelperRuntime, HelperRuntimeBuilder};

/// Standard helper entry point: log to stderr and serve the broker on stdio.
pub async fn helper_main(runtime: HelperRuntime) -> Result<(), HelperError> {
    init_helper_tracing();
    runtime.serve_stdio().await
}
