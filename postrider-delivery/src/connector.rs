//! Session acquisition: the preparer/connector pair and the idle sweep.
//!
//! The preparer pins a message to a source address and to the resolved
//! route, then hands it to the connector. The connector walks the route's
//! MX hosts looking for a reusable idle session, probing each candidate
//! with `NOOP`, and opens a fresh session when the pool still has room.
//! When the destination refuses a new session the pool's cap latches and
//! acquisition falls back to waiting for a working session to come home,
//! paced by the sleep timeout, up to the connection retry budget.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_channel::Sender;
use postrider_common::{Signal, Timeouts, MAX_TRY_CONNECTION_COUNT};
use postrider_smtp::{ClientError, SmtpClient};
use tokio::{sync::broadcast, time::timeout};
use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::{
    error::DeliveryError,
    event::SendEvent,
    pool::{ClientPool, ClientState, PooledClient},
    seeker::{MxHost, RouteState, Seeker},
};

/// Cadence of the idle-session sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(6);

/// Binds an event to a source address and a resolved route.
pub(crate) struct Preparer {
    seeker: Arc<Seeker>,
    sources: Vec<IpAddr>,
    timeouts: Timeouts,
    next: Sender<SendEvent>,
}

impl Preparer {
    pub(crate) fn new(
        seeker: Arc<Seeker>,
        sources: Vec<IpAddr>,
        timeouts: Timeouts,
        next: Sender<SendEvent>,
    ) -> Self {
        Self {
            seeker,
            sources,
            timeouts,
            next,
        }
    }

    pub(crate) async fn handle(&self, worker: usize, mut event: SendEvent) {
        let Some(hostname) = event.message.hostname_to.clone() else {
            event.fail(&DeliveryError::InvalidAddress);
            return;
        };

        // deterministic source binding: worker n sends from ips[n % len]
        event.source = Some(self.sources[worker % self.sources.len()]);

        loop {
            match self.seeker.route(worker, &hostname).await {
                RouteState::Pending => {
                    tracing::debug!(worker, mail = event.message.id, %hostname, "lookup pending");
                    tokio::time::sleep(self.timeouts.sleep).await;
                }
                RouteState::Ready(route) => {
                    event.route = Some(route);
                    if self.next.send(event).await.is_err() {
                        tracing::debug!(worker, "next stage is gone, dropping event");
                    }
                    return;
                }
                RouteState::Failed => {
                    event.fail(&DeliveryError::Lookup(hostname));
                    return;
                }
            }
        }
    }
}

/// Finds or creates the session an event will be delivered over.
pub(crate) struct Connector {
    timeouts: Timeouts,
    extra_roots: Arc<Vec<CertificateDer<'static>>>,
    next: Sender<SendEvent>,
}

impl Connector {
    pub(crate) fn new(
        timeouts: Timeouts,
        extra_roots: Arc<Vec<CertificateDer<'static>>>,
        next: Sender<SendEvent>,
    ) -> Self {
        Self {
            timeouts,
            extra_roots,
            next,
        }
    }

    pub(crate) async fn handle(&self, worker: usize, mut event: SendEvent) {
        let (Some(route), Some(source), Some(hostname)) = (
            event.route.clone(),
            event.source,
            event.message.hostname_to.clone(),
        ) else {
            event.fail(&DeliveryError::Internal);
            return;
        };

        loop {
            event.try_count += 1;

            for mx in route.iter() {
                let Some(pool) = mx.pool(source) else {
                    continue;
                };

                let (mut client, discarded) = self.checkout(worker, &event, mx, &pool).await;

                if client.is_none() && (!pool.has_limit() || discarded) {
                    match self.open_client(worker, &event, mx, &pool, source).await {
                        Ok(created) => client = Some(created),
                        Err(error) => {
                            // the destination will not give us another
                            // session from this source; stop asking
                            pool.latch_limit();
                            tracing::warn!(
                                worker,
                                mail = event.message.id,
                                mx = %mx.hostname,
                                size = pool.size(),
                                %error,
                                "can't open session, pool capped"
                            );
                        }
                    }
                }

                if let Some(client) = client {
                    tracing::debug!(
                        worker,
                        mail = event.message.id,
                        client = client.id,
                        mx = %mx.hostname,
                        "session ready"
                    );
                    event.client = Some(client);
                    event.pool = Some(pool);
                    if self.next.send(event).await.is_err() {
                        tracing::debug!(worker, "next stage is gone, dropping event");
                    }
                    return;
                }
            }

            if event.try_count >= MAX_TRY_CONNECTION_COUNT {
                event.fail(&DeliveryError::ConnectExhausted(hostname));
                return;
            }

            tracing::debug!(
                worker,
                mail = event.message.id,
                try_count = event.try_count,
                "no free session, waiting"
            );
            tokio::time::sleep(self.timeouts.sleep).await;
        }
    }

    /// Pops idle clients until one answers a `NOOP`. Dead and expired
    /// clients are torn down on the way; the second return says whether
    /// any were, which frees a slot even in a capped pool.
    async fn checkout(
        &self,
        worker: usize,
        event: &SendEvent,
        mx: &MxHost,
        pool: &ClientPool,
    ) -> (Option<PooledClient>, bool) {
        let mut discarded = false;

        while let Some(mut client) = pool.pop() {
            if client.state() == ClientState::Disconnected
                || client.is_expired(self.timeouts.waiting)
            {
                tracing::debug!(
                    worker,
                    mail = event.message.id,
                    client = client.id,
                    mx = %mx.hostname,
                    "idle session expired"
                );
                client.close();
                pool.shrink();
                discarded = true;
                continue;
            }

            match timeout(self.timeouts.hello, client.session.noop()).await {
                Ok(Ok(response)) if response.is_success() => {
                    client.wakeup();
                    return (Some(client), discarded);
                }
                _ => {
                    tracing::debug!(
                        worker,
                        mail = event.message.id,
                        client = client.id,
                        mx = %mx.hostname,
                        "idle session is dead"
                    );
                    client.close();
                    pool.shrink();
                    discarded = true;
                }
            }
        }

        (None, discarded)
    }

    async fn open_client(
        &self,
        worker: usize,
        event: &SendEvent,
        mx: &MxHost,
        pool: &ClientPool,
        source: IpAddr,
    ) -> Result<PooledClient, DeliveryError> {
        let session = self.open_session(worker, event, mx, source).await?;
        let id = mx.next_client_id();
        pool.grow();
        tracing::debug!(
            worker,
            mail = event.message.id,
            client = id,
            mx = %mx.hostname,
            tls = session.is_tls(),
            "session opened"
        );
        Ok(PooledClient::new(id, session))
    }

    /// Dials and greets one MX host, upgrading to TLS when the host still
    /// has it enabled. A failed upgrade latches TLS off for the host, the
    /// partial session is dismissed, and the dial starts over in plain;
    /// many destinations refuse to continue a session after a failed
    /// STARTTLS.
    async fn open_session(
        &self,
        worker: usize,
        event: &SendEvent,
        mx: &MxHost,
        source: IpAddr,
    ) -> Result<SmtpClient, DeliveryError> {
        let helo = event
            .message
            .hostname_from
            .as_ref()
            .map_or("localhost", |hostname| hostname.as_str());

        loop {
            let addr = dial_addr(mx).await?;
            tracing::debug!(worker, mail = event.message.id, %addr, %source, "dialing");

            let session = timeout(
                self.timeouts.connection,
                SmtpClient::connect(addr, Some(source)),
            )
            .await
            .map_err(|_| DeliveryError::Timeout("connect"))??;

            let mut session = timeout(self.timeouts.hello, greet(session, helo, mx))
                .await
                .map_err(|_| DeliveryError::Timeout("hello"))??;

            if !mx.use_tls() {
                return Ok(session);
            }

            match timeout(
                self.timeouts.hello,
                session.starttls(&mx.real_server_name, &self.extra_roots),
            )
            .await
            {
                Err(_) => return Err(DeliveryError::Timeout("starttls")),
                Ok(Ok(response)) if response.is_success() => {
                    // RFC 3207: the session state resets with the transport
                    let response = timeout(self.timeouts.hello, session.ehlo(helo))
                        .await
                        .map_err(|_| DeliveryError::Timeout("ehlo"))??;
                    if !response.is_success() {
                        return Err(DeliveryError::rejected(&response));
                    }
                    return Ok(session);
                }
                Ok(Ok(response)) => {
                    tracing::warn!(
                        worker,
                        mail = event.message.id,
                        mx = %mx.hostname,
                        code = response.code,
                        "starttls refused, falling back to plain"
                    );
                    mx.dont_use_tls();
                    let _ = timeout(self.timeouts.hello, session.quit()).await;
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        worker,
                        mail = event.message.id,
                        mx = %mx.hostname,
                        %error,
                        "starttls failed, falling back to plain"
                    );
                    mx.dont_use_tls();
                    drop(session);
                }
            }
        }
    }

    /// The idle sweep: closes sessions whose waiting clock ran out and
    /// lets their pools grow again.
    pub(crate) async fn sweep(
        seeker: Arc<Seeker>,
        waiting: Duration,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let culled = seeker.sweep_idle(waiting);
                    if culled > 0 {
                        tracing::debug!(culled, "swept expired sessions");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

/// Greeting and EHLO/HELO on a fresh connection. Folds the STARTTLS
/// advertisement into the host's latch.
async fn greet(mut session: SmtpClient, helo: &str, mx: &MxHost) -> Result<SmtpClient, DeliveryError> {
    let greeting = session.read_greeting().await?;
    if !greeting.is_success() {
        return Err(DeliveryError::rejected(&greeting));
    }

    let response = session.ehlo(helo).await?;
    if response.is_success() {
        if mx.use_tls() {
            mx.refresh_tls_support(response.has_extension("STARTTLS"));
        }
        return Ok(session);
    }

    // not an ESMTP host: fall back to HELO, which also rules out STARTTLS
    let response = session.helo(helo).await?;
    if !response.is_success() {
        return Err(DeliveryError::rejected(&response));
    }
    mx.refresh_tls_support(false);
    Ok(session)
}

async fn dial_addr(mx: &MxHost) -> Result<SocketAddr, DeliveryError> {
    if let Some(addr) = mx.dial_addr() {
        return Ok(addr);
    }
    // no A records survived resolution; let the system resolver try
    let mut addrs = tokio::net::lookup_host((mx.hostname.as_str(), mx.port))
        .await
        .map_err(|error| DeliveryError::Client(ClientError::Io(error)))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| DeliveryError::Lookup(mx.hostname.clone()))
}

