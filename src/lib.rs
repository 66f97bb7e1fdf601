//! RelayTap Library
//!
//! Intercepting TCP relay for protocol instrumentation, man-in-the-middle
//! testing and fault injection.
//!
//! An [`Adaptor`] listens on one endpoint and relays every accepted
//! connection to a fixed target. Each chunk crossing the relay is handed to
//! an [`InterceptionHook`] that may forward it, bounce it back to its sender
//! or drop it, and external callers can inject payloads into either side of
//! the live session.

pub mod config;
pub mod error;
pub mod output;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use error::AdaptorError;
pub use relay::{Action, Adaptor, Decision, Direction, InterceptionHook};
pub use shutdown::ShutdownCoordinator;

/// Common error type for configuration and application glue
pub type Result<T> = anyhow::Result<T>;
