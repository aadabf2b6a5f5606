use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("outbound queue closed")]
    Closed,
    #[error("send to {addr} failed: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a single bot update is abandoned. The bot is demoted to Idle.
#[derive(Debug, Error, PartialEq)]
pub enum BotError {
    #[error("bot position is not finite")]
    NonFinitePosition,
    #[error("patrol has no waypoints")]
    EmptyPatrol,
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("no session for {0}")]
    Gone(SocketAddr),
}
