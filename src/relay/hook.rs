//! Interception Hooks
//!
//! A hook sees every chunk drained from one side of the relay and decides
//! what happens to it. Hooks run inline on the relay pump, so a slow hook
//! delays the other direction and any pending injections for that tick.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the relay a chunk was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Read from the accepted (listener-side) connection, heading to the target
    ListenerToTarget,
    /// Read from the target connection, heading back to the listener side
    TargetToListener,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ListenerToTarget => write!(f, "listener->target"),
            Direction::TargetToListener => write!(f, "target->listener"),
        }
    }
}

/// What to do with an intercepted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Forward to the other peer
    Pass,
    /// Write back to the peer that sent it
    Back,
    /// Discard
    Stop,
}

/// A hook's verdict on a chunk, together with the bytes to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub data: Bytes,
}

impl Decision {
    pub fn new(action: Action, data: impl Into<Bytes>) -> Self {
        Self {
            action,
            data: data.into(),
        }
    }

    pub fn pass(data: impl Into<Bytes>) -> Self {
        Self::new(Action::Pass, data)
    }

    pub fn back(data: impl Into<Bytes>) -> Self {
        Self::new(Action::Back, data)
    }

    pub fn stop() -> Self {
        Self::new(Action::Stop, Bytes::new())
    }
}

/// Observes and rewrites traffic for one direction of the relay.
///
/// Closures of the form `Fn(Bytes) -> Decision` are hooks too; implement the
/// trait directly when the hook can fail. A failing hook ends the current
/// session and stops the adaptor once both sockets are closed.
pub trait InterceptionHook: Send + Sync {
    fn intercept(&self, chunk: Bytes) -> anyhow::Result<Decision>;
}

impl<F> InterceptionHook for F
where
    F: Fn(Bytes) -> Decision + Send + Sync,
{
    fn intercept(&self, chunk: Bytes) -> anyhow::Result<Decision> {
        Ok(self(chunk))
    }
}

/// Default hook: forwards every chunk unmodified
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl InterceptionHook for PassThrough {
    fn intercept(&self, chunk: Bytes) -> anyhow::Result<Decision> {
        Ok(Decision::pass(chunk))
    }
}
