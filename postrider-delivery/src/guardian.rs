//! The blacklist gate, first stage of the pipeline.

use ahash::AHashSet;
use async_channel::Sender;
use postrider_common::Domain;

use crate::{error::DeliveryError, event::SendEvent};

/// Refuses messages to excluded recipient hostnames; forwards the rest
/// untouched. Stateless, so any number of workers can share one instance.
pub(crate) struct Guardian {
    exclude: AHashSet<Domain>,
    next: Sender<SendEvent>,
}

impl Guardian {
    pub(crate) fn new(exclude: impl IntoIterator<Item = Domain>, next: Sender<SendEvent>) -> Self {
        Self {
            exclude: exclude.into_iter().collect(),
            next,
        }
    }

    pub(crate) async fn handle(&self, worker: usize, event: SendEvent) {
        if let Some(hostname) = event.message.hostname_to.clone() {
            if self.exclude.contains(&hostname) {
                tracing::info!(
                    worker,
                    mail = event.message.id,
                    %hostname,
                    "recipient hostname is excluded"
                );
                event.fail(&DeliveryError::Blacklisted(hostname));
                return;
            }
        }

        if self.next.send(event).await.is_err() {
            tracing::debug!(worker, "next stage is gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::MailMessage;

    use super::*;
    use crate::event::Disposition;

    #[tokio::test]
    async fn test_blacklisted_recipient_is_refused() {
        let (next, _next_rx) = async_channel::unbounded();
        let guardian = Guardian::new([Domain::new("spamtrap.example")], next);

        let message = MailMessage::new("a@ex.org", "b@spamtrap.example", "body");
        let (event, receiver) = SendEvent::new(message);
        guardian.handle(1, event).await;

        let outcome = receiver.await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Error);
        assert_eq!(outcome.message.error.unwrap().code, Some(511));
    }

    #[tokio::test]
    async fn test_clean_recipient_is_forwarded() {
        let (next, next_rx) = async_channel::unbounded();
        let guardian = Guardian::new([Domain::new("spamtrap.example")], next);

        let message = MailMessage::new("a@ex.org", "b@dest.tld", "body");
        let (event, _receiver) = SendEvent::new(message);
        guardian.handle(1, event).await;

        let forwarded = next_rx.recv().await.unwrap();
        assert_eq!(forwarded.message.recipient, "b@dest.tld");
    }
}
