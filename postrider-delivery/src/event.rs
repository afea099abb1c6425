//! The in-pipeline carrier and its terminal outcome.

use std::{net::IpAddr, sync::Arc};

use postrider_common::{Binding, MailMessage};
use tokio::sync::oneshot;

use crate::{
    error::DeliveryError,
    pool::{ClientPool, PooledClient},
    seeker::MxHost,
};

/// The four terminal classifications a traversal can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The SMTP transaction completed; the broker delivery is acknowledged.
    Success,
    /// A per-destination limit overflowed; reroute to the limit's binding.
    Overlimit,
    /// Transient failure; reroute to the next-longer delayed queue.
    Delay,
    /// Terminal failure; reroute to the failure queue.
    Error,
}

impl Disposition {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Overlimit => "overlimit",
            Self::Delay => "delay",
            Self::Error => "error",
        }
    }
}

/// What the consumer gets back: the disposition plus the message itself,
/// with whatever bookkeeping the traversal added (fault, binding).
#[derive(Debug)]
pub struct SendOutcome {
    pub disposition: Disposition,
    pub message: MailMessage,
}

impl SendOutcome {
    /// The delayed queue the message should be republished to, or `None`
    /// when the broker delivery should simply be acknowledged.
    #[must_use]
    pub fn republish_binding(&self) -> Option<Binding> {
        match self.disposition {
            Disposition::Success => None,
            Disposition::Overlimit => Some(self.message.binding),
            Disposition::Delay => Some(self.message.binding.next()),
            Disposition::Error => Some(Binding::NotSend),
        }
    }
}

/// One message traversing the pipeline.
///
/// The event owns the message; stages hand the whole event forward or
/// terminate it. Termination consumes the event, which is how the
/// exactly-once result contract is enforced at compile time.
pub struct SendEvent {
    pub message: MailMessage,

    /// Source address this traversal dials from; bound by the preparer.
    pub source: Option<IpAddr>,

    /// Resolved MX hosts, priority order; attached by the preparer.
    pub route: Option<Arc<Vec<Arc<MxHost>>>>,

    /// The session carrying the transaction; attached by the connector.
    pub client: Option<PooledClient>,

    /// The pool the client must be returned to.
    pub pool: Option<Arc<ClientPool>>,

    /// Connection-acquisition attempts so far.
    pub try_count: u32,

    result: oneshot::Sender<SendOutcome>,
}

impl SendEvent {
    /// Creates an event and the receiver its outcome will arrive on.
    #[must_use]
    pub fn new(message: MailMessage) -> (Self, oneshot::Receiver<SendOutcome>) {
        let (result, receiver) = oneshot::channel();
        (
            Self {
                message,
                source: None,
                route: None,
                client: None,
                pool: None,
                try_count: 0,
                result,
            },
            receiver,
        )
    }

    /// Terminates the traversal. The consumer may have stopped listening;
    /// that is its business, not ours.
    pub fn finish(self, disposition: Disposition) {
        tracing::debug!(
            mail = self.message.id,
            disposition = disposition.as_str(),
            "traversal finished"
        );
        let _ = self.result.send(SendOutcome {
            disposition,
            message: self.message,
        });
    }

    /// Records the fault on the message and terminates with the
    /// classification the fault maps to.
    pub fn fail(mut self, error: &DeliveryError) {
        tracing::info!(mail = self.message.id, %error, "can't deliver");
        self.message.error = Some(error.fault());
        self.finish(error.disposition());
    }
}
