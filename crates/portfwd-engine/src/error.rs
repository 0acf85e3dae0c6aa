//! Forwarding engine error types.

use std::net::SocketAddr;
use std::sync::Arc;

/// Errors raised by a [`Forwarder`](crate::Forwarder) and its relay sessions.
///
/// Cloneable so the same error can be returned to a caller and published on
/// the event bus.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForwardError {
    #[error("Can't resolve '{host}': {reason}")]
    AddressResolution { host: String, reason: String },

    #[error("Can't listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Can't connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Transport error with {peer}: {source}")]
    Transport {
        peer: SocketAddr,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

impl ForwardError {
    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind {
            addr,
            source: Arc::new(source),
        }
    }

    pub(crate) fn connect(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Connect {
            addr,
            source: Arc::new(source),
        }
    }

    pub(crate) fn transport(peer: SocketAddr, source: std::io::Error) -> Self {
        Self::Transport {
            peer,
            source: Arc::new(source),
        }
    }
}
