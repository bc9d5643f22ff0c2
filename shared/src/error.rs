//! Error types for Portgate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No tunnel reserved for the given public key or tunnel id.
    #[error("no tunnel for {0}")]
    NotFound(String),

    /// Tunnel exists but has no live control connection.
    #[error("tunnel {0} has no live control connection")]
    NotConnected(String),

    /// A unary request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The tunnel's in-flight state was dropped while this request was
    /// pending: a new control connection attached, or the tunnel was
    /// detached or revoked. Indistinguishable at the waiter, and mapped
    /// identically (502) at the public boundary.
    #[error("control connection superseded or torn down")]
    Superseded,

    /// Subdomain or tunnel id is already taken.
    #[error("subdomain or tunnel id already reserved")]
    AlreadyReserved,

    /// No free port left in the configured public TCP range.
    #[error("no free public TCP port")]
    PortsExhausted,

    /// Connection id does not fit the 16-bit length prefix.
    #[error("connection id is {0} bytes, limit is 65535")]
    ConnectionIdTooLong(usize),

    /// Binary frame carried a non-UTF-8 connection id.
    #[error("malformed binary frame")]
    MalformedFrame,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
