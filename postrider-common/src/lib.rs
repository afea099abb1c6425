//! Shared types for the postrider delivery engine.
//!
//! Everything here is consumed by both the delivery pipeline and the daemon
//! binary: the message model, the retry-queue bindings, configuration and
//! logging bootstrap.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod binding;
pub mod config;
pub mod domain;
pub mod logging;
pub mod message;

pub use binding::Binding;
pub use config::{Config, Timeouts};
pub use domain::Domain;
pub use message::{MailMessage, SmtpFault};

/// Maximum connection-acquisition attempts for a single traversal before the
/// message is classified as undeliverable.
pub const MAX_TRY_CONNECTION_COUNT: u32 = 30;

/// Maximum broker-side delivery attempts for a single message. Enforced by
/// the queue consumer, surfaced here so both sides agree on the number.
pub const MAX_SENDING_COUNT: u32 = 96;

/// Process-wide lifecycle signal, broadcast to the periodic workers.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
