//! Fault taxonomy and result classification.
//!
//! A failed traversal ends in exactly one of two queues: a delayed retry
//! queue (`Delay`) or the terminal failure queue (`Error`). The mapping is
//! driven by the SMTP reply code when one exists, and by the failure kind
//! when it does not.

use postrider_common::{Domain, SmtpFault};
use postrider_smtp::ClientError;
use thiserror::Error;

use crate::event::Disposition;

/// Why a traversal could not complete.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The recipient hostname is on the configured blacklist.
    #[error("511 {0} is blacklisted")]
    Blacklisted(Domain),

    /// MX resolution failed for the recipient hostname.
    #[error("511 can't lookup {0}")]
    Lookup(Domain),

    /// Envelope or recipient does not look like an email address.
    #[error("511 envelope or recipient is invalid")]
    InvalidAddress,

    /// The connection retry budget ran out without a usable session.
    #[error("can't connect to {0}")]
    ConnectExhausted(Domain),

    /// A wire operation outlived its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The server answered a command with a reply we cannot proceed from.
    #[error("{code} {text}")]
    Rejected { code: u16, text: String },

    /// Transport-level failure from the SMTP client.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A stage precondition the wiring guarantees was violated.
    #[error("500 internal pipeline error")]
    Internal,
}

impl DeliveryError {
    /// A reply the transaction cannot proceed from.
    pub(crate) fn rejected(response: &postrider_smtp::Response) -> Self {
        Self::Rejected {
            code: response.code,
            text: response.message(),
        }
    }

    /// Where this failure sends the message.
    ///
    /// Replies route by code. Transport faults and timeouts are transient
    /// by nature and retry on a delayed queue. Policy rejections and an
    /// exhausted connection budget are final.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Blacklisted(_)
            | Self::Lookup(_)
            | Self::InvalidAddress
            | Self::ConnectExhausted(_)
            | Self::Internal => Disposition::Error,
            Self::Timeout(_) | Self::Client(_) => Disposition::Delay,
            Self::Rejected { code, .. } => classify_code(Some(*code)),
        }
    }

    /// The fault recorded on the message for the broker side.
    #[must_use]
    pub fn fault(&self) -> SmtpFault {
        let text = self.to_string();
        SmtpFault {
            code: leading_code(&text),
            text,
        }
    }
}

/// Classifies a raw SMTP reply string by its leading code token.
///
/// Total over all strings: anything unparsable is conservatively treated as
/// transient.
#[must_use]
pub fn classify_reply(text: &str) -> Disposition {
    classify_code(leading_code(text))
}

fn classify_code(code: Option<u16>) -> Disposition {
    match code {
        None => Disposition::Delay,
        Some(code) if code >= 400 && code < 500 => Disposition::Delay,
        Some(_) => Disposition::Error,
    }
}

fn leading_code(text: &str) -> Option<u16> {
    text.split_whitespace().next()?.parse().ok()
}
