//! The mail message as it travels through the pipeline.

use std::{
    sync::LazyLock,
    time::{SystemTime, UNIX_EPOCH},
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Binding, Domain};

/// Envelope and recipient addresses must match this shape; the capture group
/// is the hostname used for routing, limits and the blacklist. Compiled once
/// so per-message validation does not pay for it.
#[allow(clippy::expect_used, reason = "compile-time constant pattern")]
pub static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.\_%+-]+@([\w.-]+\.\w{2,4})$").expect("email pattern is valid")
});

/// Returns `true` when the address passes the envelope/recipient shape check.
#[must_use]
pub fn is_valid_email(address: &str) -> bool {
    EMAIL_REGEX.is_match(address)
}

/// Extracts the hostname part of an address, if the address is well-formed.
#[must_use]
pub fn hostname_of(address: &str) -> Option<Domain> {
    EMAIL_REGEX
        .captures(address)
        .and_then(|captures| captures.get(1))
        .map(|hostname| Domain::new(hostname.as_str()))
}

/// The most recent delivery fault, kept with the message so the broker side
/// can route it and operators can read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpFault {
    /// Reply code parsed out of the fault text, when one was present.
    pub code: Option<u16>,
    /// Full fault text.
    #[serde(rename = "message")]
    pub text: String,
}

/// A single delivery attempt.
///
/// The serialized shape is the queue payload: `envelope`, `recipient`,
/// `body`, plus the retry bookkeeping (`bindingType`, `error`,
/// `trySendingCount`) that round-trips through the delayed queues. The
/// remaining fields are derived on ingress by [`MailMessage::init`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    /// Log identifier: nanoseconds at pipeline entry.
    #[serde(skip)]
    pub id: i64,

    pub envelope: String,
    pub recipient: String,
    pub body: String,

    /// Sender hostname, from the envelope's domain part.
    #[serde(skip)]
    pub hostname_from: Option<Domain>,

    /// Recipient hostname; routing key for every stage.
    #[serde(skip)]
    pub hostname_to: Option<Domain>,

    /// When this traversal started. The limiter windows against it.
    #[serde(skip, default = "SystemTime::now")]
    pub created: SystemTime,

    /// The delayed queue this message last came from.
    #[serde(rename = "bindingType", default)]
    pub binding: Binding,

    #[serde(default)]
    pub error: Option<SmtpFault>,

    #[serde(rename = "trySendingCount", default)]
    pub try_sending_count: u32,
}

impl MailMessage {
    /// Builds a first-attempt message and derives the ingress fields.
    #[must_use]
    pub fn new(
        envelope: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let mut message = Self {
            id: 0,
            envelope: envelope.into(),
            recipient: recipient.into(),
            body: body.into(),
            hostname_from: None,
            hostname_to: None,
            created: SystemTime::now(),
            binding: Binding::default(),
            error: None,
            try_sending_count: 0,
        };
        message.init();
        message
    }

    /// Stamps the fields a traversal needs: a fresh id and creation time,
    /// the derived hostnames, and one more attempt on the counter. Called
    /// once per pipeline entry, including redeliveries from delayed queues.
    pub fn init(&mut self) {
        self.id = now_nanos();
        self.created = SystemTime::now();
        self.try_sending_count += 1;
        self.hostname_from = hostname_of(&self.envelope);
        self.hostname_to = hostname_of(&self.recipient);
    }
}

#[allow(clippy::cast_possible_truncation, reason = "wraps in the year 2262")]
fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
