//! Pipeline construction and lifecycle.
//!
//! The stage chain is fixed at startup: each stage is built holding the
//! sender of the next one, and `workers` tasks per stage share the stage's
//! receiver. Shutdown drops the ingress sender and lets the channels drain
//! in pipeline order, with a grace period before anything is aborted.

use std::{path::Path, sync::Arc, time::Duration};

use async_channel::{bounded, Sender};
use postrider_common::{config::ConfigError, Config, MailMessage, Signal};
use thiserror::Error;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinSet,
};
use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::{
    connector::{Connector, Preparer},
    dkim::Dkim,
    event::{SendEvent, SendOutcome},
    guardian::Guardian,
    limiter::Limiter,
    mailer::Mailer,
    seeker::Seeker,
};

/// How long a shutdown waits for in-flight messages before aborting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("can't read dkim key: {0}")]
    DkimKey(std::io::Error),

    #[error("can't read certificate: {0}")]
    Certificate(std::io::Error),

    /// The pipeline has shut down and accepts no more messages.
    #[error("pipeline is closed")]
    Closed,
}

/// The assembled engine. Feed it messages with [`submit`](Self::submit);
/// every submission resolves to exactly one [`SendOutcome`].
pub struct Pipeline {
    ingress: Sender<SendEvent>,
    seeker: Arc<Seeker>,
    tasks: JoinSet<()>,
    shutdown: broadcast::Sender<Signal>,
}

impl Pipeline {
    /// Builds the stage chain and spawns its workers onto the current
    /// tokio runtime.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let config = config.validate()?;
        let timeouts = config.timeouts.clone();
        let capacity = config.workers.max(1);

        let extra_roots = Arc::new(load_extra_roots(config.certificate.as_deref())?);
        let dkim = config
            .private_key
            .as_deref()
            .map(|path| {
                std::fs::read_to_string(path)
                    .map(|pem| Dkim::new(config.dkim_selector.clone(), pem))
            })
            .transpose()
            .map_err(PipelineError::DkimKey)?;

        let (ingress, guardian_rx) = bounded(capacity);
        let (limiter_tx, limiter_rx) = bounded(capacity);
        let (preparer_tx, preparer_rx) = bounded(capacity);
        let (connector_tx, connector_rx) = bounded(capacity);
        let (mailer_tx, mailer_rx) = bounded(capacity);

        let seeker = Arc::new(Seeker::new(config.ips.clone()));
        let guardian = Arc::new(Guardian::new(config.exclude.clone(), limiter_tx));
        let limiter = Arc::new(Limiter::new(&config.limits, preparer_tx));
        let preparer = Arc::new(Preparer::new(
            seeker.clone(),
            config.ips.clone(),
            timeouts.clone(),
            connector_tx,
        ));
        let connector = Arc::new(Connector::new(timeouts.clone(), extra_roots, mailer_tx));
        let mailer = Arc::new(Mailer::new(timeouts.clone(), dkim));

        let (shutdown, _) = broadcast::channel(8);
        let mut tasks = JoinSet::new();

        for worker in 0..config.workers {
            {
                let stage = guardian.clone();
                let rx = guardian_rx.clone();
                tasks.spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        stage.handle(worker, event).await;
                    }
                });
            }
            {
                let stage = limiter.clone();
                let rx = limiter_rx.clone();
                tasks.spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        stage.handle(worker, event).await;
                    }
                });
            }
            {
                let stage = preparer.clone();
                let rx = preparer_rx.clone();
                tasks.spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        stage.handle(worker, event).await;
                    }
                });
            }
            {
                let stage = connector.clone();
                let rx = connector_rx.clone();
                tasks.spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        stage.handle(worker, event).await;
                    }
                });
            }
            {
                let stage = mailer.clone();
                let rx = mailer_rx.clone();
                tasks.spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        stage.handle(worker, event).await;
                    }
                });
            }
        }

        {
            let limiter = limiter.clone();
            let rx = shutdown.subscribe();
            tasks.spawn(async move { limiter.clean(rx).await });
        }
        {
            let seeker = seeker.clone();
            let rx = shutdown.subscribe();
            let waiting = timeouts.waiting;
            tasks.spawn(async move { Connector::sweep(seeker, waiting, rx).await });
        }

        tracing::info!(workers = config.workers, ips = config.ips.len(), "pipeline up");

        Ok(Self {
            ingress,
            seeker,
            tasks,
            shutdown,
        })
    }

    /// The resolver cache, exposed for seeding and operator commands.
    #[must_use]
    pub fn seeker(&self) -> &Arc<Seeker> {
        &self.seeker
    }

    /// Hands a message to the first stage. The returned receiver resolves
    /// with the traversal's single terminal outcome.
    pub async fn submit(
        &self,
        message: MailMessage,
    ) -> Result<oneshot::Receiver<SendOutcome>, PipelineError> {
        let (event, receiver) = SendEvent::new(message);
        self.ingress
            .send(event)
            .await
            .map_err(|_| PipelineError::Closed)?;
        Ok(receiver)
    }

    /// Drains and stops the engine: stage channels close in pipeline
    /// order, the periodic workers get the shutdown signal, and whatever
    /// is still running after the grace period is aborted.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        drop(self.ingress);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("shutdown grace expired, aborting workers");
                    self.tasks.abort_all();
                    break;
                }
            }
        }
    }
}

fn load_extra_roots(
    path: Option<&Path>,
) -> Result<Vec<CertificateDer<'static>>, PipelineError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let data = std::fs::read(path).map_err(PipelineError::Certificate)?;
    rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(PipelineError::Certificate)
}
