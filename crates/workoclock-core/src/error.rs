//! Control plane error types.

use std::{io, net::SocketAddr};
use thiserror::Error;

/// Errors raised by the control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The fixed local address is unavailable. Fatal at startup.
    #[error("failed to bind control channel to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("control channel IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] bincode::Error),

    /// The encoded message would not fit in one datagram.
    #[error("control message of {size} bytes exceeds the {max} byte datagram limit")]
    TooLarge { size: usize, max: usize },
}

/// Errors raised by the service supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No background strategy is available on this host. Fatal, no fallback.
    #[error("no enforcement strategy is available on this platform")]
    UnsupportedPlatform,

    #[error("enforcement is already running")]
    AlreadyRunning,

    #[error("failed to launch enforcement ({strategy}): {source}")]
    Launch {
        strategy: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
