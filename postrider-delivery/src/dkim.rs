//! DKIM signing glue.
//!
//! Signing is fail-open: a message that cannot be signed is still sent,
//! unsigned, and the failure is logged. Signers are cached per envelope,
//! since the envelope determines both the signing domain and the agent
//! identity, and a sending installation only ever has a handful of them.

use std::sync::Arc;

use dashmap::DashMap;
use mail_auth::{
    common::crypto::{RsaKey, Sha256},
    common::headers::HeaderWriter,
    dkim::{Canonicalization, Done, DkimSigner},
};
use postrider_common::MailMessage;
use thiserror::Error;

/// Headers covered by the signature.
const SIGNED_HEADERS: [&str; 5] = ["From", "To", "Subject", "Date", "Message-ID"];

#[derive(Debug, Error)]
pub(crate) enum DkimError {
    /// No sender hostname to sign for.
    #[error("message has no sender domain")]
    NoSenderDomain,

    #[error("{0}")]
    Signing(String),
}

/// Per-envelope signer cache around one configured private key.
pub(crate) struct Dkim {
    selector: String,
    key_pem: String,
    signers: DashMap<String, Arc<DkimSigner<RsaKey<Sha256>, Done>>>,
}

impl Dkim {
    pub(crate) fn new(selector: String, key_pem: String) -> Self {
        Self {
            selector,
            key_pem,
            signers: DashMap::new(),
        }
    }

    /// Signs the message body and returns it with the `DKIM-Signature`
    /// header prepended.
    pub(crate) fn sign(&self, message: &MailMessage) -> Result<String, DkimError> {
        let signer = self.signer_for(message)?;
        let signature = signer
            .sign(message.body.as_bytes())
            .map_err(|error| DkimError::Signing(error.to_string()))?;
        Ok(format!("{}{}", signature.to_header(), message.body))
    }

    fn signer_for(
        &self,
        message: &MailMessage,
    ) -> Result<Arc<DkimSigner<RsaKey<Sha256>, Done>>, DkimError> {
        if let Some(signer) = self.signers.get(&message.envelope) {
            return Ok(signer.clone());
        }

        let domain = message
            .hostname_from
            .as_ref()
            .ok_or(DkimError::NoSenderDomain)?;
        let key = RsaKey::<Sha256>::from_rsa_pem(&self.key_pem)
            .map_err(|error| DkimError::Signing(error.to_string()))?;
        let signer = Arc::new(
            DkimSigner::from_key(key)
                .domain(domain.to_string())
                .selector(self.selector.clone())
                .headers(SIGNED_HEADERS)
                .agent_user_identifier(message.envelope.clone())
                .header_canonicalization(Canonicalization::Relaxed)
                .body_canonicalization(Canonicalization::Relaxed),
        );
        self.signers
            .insert(message.envelope.clone(), signer.clone());
        Ok(signer)
    }
}
