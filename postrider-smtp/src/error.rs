//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors a client operation can produce. Reply codes are not errors at
/// this layer: commands return the parsed [`Response`](crate::Response) and
/// the caller decides what a 4xx or 5xx means for the message.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection mid-session.
    #[error("connection closed unexpectedly")]
    Closed,

    #[error("tls error: {0}")]
    Tls(String),

    /// The peer sent something that is not an SMTP response.
    #[error("can't parse response: {0}")]
    Parse(String),

    #[error("response is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Specialized `Result` for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
