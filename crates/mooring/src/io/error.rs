use std::net::SocketAddr;
use thiserror::Error;

/// Failures surfaced by the acceptor API. Anything that happens on a
/// background thread is routed to the fault sink instead and never appears
/// here.
#[derive(Debug, Error)]
pub enum Error {
    /// An endpoint could not be opened for listening. `bind` rolls back every
    /// endpoint it already opened before returning this.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The acceptor has been disposed; only `dispose` itself remains callable.
    #[error("acceptor has been disposed")]
    Disposed,

    /// The session processor refused to take ownership of a new session.
    #[error("session rejected by processor: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
