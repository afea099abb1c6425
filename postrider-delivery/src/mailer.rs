//! The SMTP transaction, last stage of the pipeline.

use postrider_common::{message::is_valid_email, MailMessage, Timeouts};
use postrider_smtp::SmtpClient;
use tokio::time::timeout;

use crate::{
    dkim::Dkim,
    error::DeliveryError,
    event::{Disposition, SendEvent},
};

/// Validates, signs and sends. The session is returned to its pool whatever
/// the outcome; the next checkout's probe, or the sweep, culls it if the
/// failure broke it.
pub(crate) struct Mailer {
    timeouts: Timeouts,
    dkim: Option<Dkim>,
}

impl Mailer {
    pub(crate) fn new(timeouts: Timeouts, dkim: Option<Dkim>) -> Self {
        Self { timeouts, dkim }
    }

    pub(crate) async fn handle(&self, worker: usize, mut event: SendEvent) {
        if !is_valid_email(&event.message.envelope) || !is_valid_email(&event.message.recipient) {
            event.fail(&DeliveryError::InvalidAddress);
            return;
        }

        if let Some(dkim) = &self.dkim {
            match dkim.sign(&event.message) {
                Ok(signed) => event.message.body = signed,
                Err(error) => {
                    tracing::warn!(
                        worker,
                        mail = event.message.id,
                        %error,
                        "can't sign, sending unsigned"
                    );
                }
            }
        }

        let Some(mut client) = event.client.take() else {
            event.fail(&DeliveryError::Internal);
            return;
        };

        tracing::debug!(
            worker,
            mail = event.message.id,
            client = client.id,
            "transaction starting"
        );
        let outcome = self.transact(&mut client.session, &event.message).await;

        if outcome.is_err() {
            // leave the session in a reusable state for the next message
            let _ = timeout(self.timeouts.mail, client.session.rset()).await;
        }

        client.wait();
        if let Some(pool) = event.pool.clone() {
            pool.push(client);
        }

        match outcome {
            Ok(()) => {
                tracing::info!(
                    worker,
                    mail = event.message.id,
                    recipient = %event.message.recipient,
                    "delivered"
                );
                event.finish(Disposition::Success);
            }
            Err(error) => event.fail(&error),
        }
    }

    /// One full transaction on an open session: MAIL, RCPT, DATA, the body,
    /// the closing dot, then RSET so the session can carry the next
    /// message. Every step runs under its configured deadline.
    async fn transact(
        &self,
        session: &mut SmtpClient,
        message: &MailMessage,
    ) -> Result<(), DeliveryError> {
        let response = timeout(self.timeouts.mail, session.mail_from(&message.envelope))
            .await
            .map_err(|_| DeliveryError::Timeout("MAIL FROM"))??;
        if !response.is_success() {
            return Err(DeliveryError::rejected(&response));
        }

        let response = timeout(self.timeouts.rcpt, session.rcpt_to(&message.recipient))
            .await
            .map_err(|_| DeliveryError::Timeout("RCPT TO"))??;
        if !response.is_success() {
            return Err(DeliveryError::rejected(&response));
        }

        let response = timeout(self.timeouts.data, session.data())
            .await
            .map_err(|_| DeliveryError::Timeout("DATA"))??;
        if !response.is_intermediate() {
            return Err(DeliveryError::rejected(&response));
        }

        let response = timeout(self.timeouts.data, session.send_data(message.body.as_bytes()))
            .await
            .map_err(|_| DeliveryError::Timeout("message body"))??;
        if !response.is_success() {
            return Err(DeliveryError::rejected(&response));
        }

        let response = timeout(self.timeouts.data, session.rset())
            .await
            .map_err(|_| DeliveryError::Timeout("RSET"))??;
        if !response.is_success() {
            return Err(DeliveryError::rejected(&response));
        }

        Ok(())
    }
}
