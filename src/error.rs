//! Adaptor Errors
//!
//! Failures that stop the adaptor and surface from [`crate::Adaptor::start`].
//! Mid-session socket faults are not represented here: they end the current
//! session and the accept loop carries on.

use std::net::SocketAddr;
use thiserror::Error;

use crate::relay::Direction;

#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("Failed to bind listener to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to target {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept inbound connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Interception hook failed on {direction} chunk: {source}")]
    Hook {
        direction: Direction,
        #[source]
        source: anyhow::Error,
    },

    #[error("Adaptor is already running")]
    AlreadyRunning,
}

impl AdaptorError {
    /// True for errors raised while setting up the target side of a session
    pub fn is_connect(&self) -> bool {
        matches!(self, AdaptorError::Connect { .. })
    }
}
