use thiserror::Error;

/// Errors surfaced by every transport this crate exposes.
///
/// Logical failures (missing record, CAS mismatch, ...) are *not* represented
/// here — call sites return `Option::None` or `bool` for those, per the
/// server's own success/failure split. See the per-method docs.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad construction-time configuration: unknown serializer, a serializer
    /// whose optional backend isn't compiled in, or an invalid option
    /// combination. Raised once, at `Client` construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dial failure, unexpected EOF, or any other I/O error. The connection
    /// that produced this must not be returned to the pool.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// A per-connection I/O deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The wire framing didn't match what the protocol expects: unexpected
    /// op byte, truncated frame, odd-length list where pairs were expected.
    /// Fatal for the connection that produced it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server understood the request but refused it: binary-A `0xBF`,
    /// a nonzero binary-B status byte, or an HTTP status this crate doesn't
    /// treat as a logical failure. The connection is still reusable.
    #[error("server error: {0}")]
    Server(String),

    /// The connection pool has no idle connections and is already at
    /// `max_total`.
    #[error("connection pool exhausted")]
    PoolExhausted,
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClientError::Timeout
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ClientError::Timeout;
        }
        ClientError::Connection(std::io::Error::other(err))
    }
}
