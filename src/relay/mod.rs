//! Intercepting Relay
//!
//! Accept loop, duplex pump, interception hooks and injection queues.

pub mod adaptor;
pub mod hook;
pub mod peer;
pub mod queue;
pub mod session;

pub use adaptor::{Adaptor, DEFAULT_READ_CHUNK_SIZE, DEFAULT_TICK_INTERVAL};
pub use hook::{Action, Decision, Direction, InterceptionHook, PassThrough};
pub use queue::{DirectionQueue, PendingSend, SendState};
pub use session::{DirectionStats, RelaySession, SessionStats};
