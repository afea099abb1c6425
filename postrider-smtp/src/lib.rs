//! Outbound SMTP client.
//!
//! A thin, connection-oriented client used by the delivery pipeline: plain
//! TCP with optional STARTTLS upgrade, source-address binding for multi-IP
//! senders, and full multi-line response parsing. Deadlines are the
//! caller's business; every operation here runs until the peer answers or
//! the connection dies.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::Response;
