//! MX resolution with a process-lifetime cache and inflight deduplication.
//!
//! The first worker to ask about a hostname owns its lookup; everyone else
//! observes the pending entry and polls at the configured sleep cadence.
//! Results, good or bad, are kept for the life of the process: mail to a
//! domain arrives in bursts, and a failed domain keeps failing fast.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use dashmap::{mapref::entry::Entry, DashMap};
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    ResolveError, TokioResolver,
};
use parking_lot::Mutex;
use postrider_common::Domain;

use crate::pool::ClientPool;

/// SMTP port every resolved MX host is dialed on.
const SMTP_PORT: u16 = 25;

/// One MX host of a destination, with its resolved addresses and the
/// connection pools feeding it.
pub struct MxHost {
    pub hostname: Domain,

    /// IPv4 addresses, deduplicated, resolver order preserved.
    pub ips: Vec<Ipv4Addr>,

    /// Reverse-DNS name presented as TLS ServerName. The mailbox domain,
    /// the MX name and the machine actually answering port 25 are three
    /// different names more often than not.
    pub real_server_name: Domain,

    pub port: u16,

    use_tls: AtomicBool,

    /// One pool per configured source address.
    pools: AHashMap<IpAddr, Arc<ClientPool>>,
}

impl MxHost {
    #[must_use]
    pub fn new(
        hostname: Domain,
        ips: Vec<Ipv4Addr>,
        real_server_name: Domain,
        port: u16,
        sources: &[IpAddr],
    ) -> Self {
        let pools = sources
            .iter()
            .map(|source| (*source, Arc::new(ClientPool::new())))
            .collect();
        Self {
            hostname,
            ips,
            real_server_name,
            port,
            use_tls: AtomicBool::new(true),
            pools,
        }
    }

    /// The pool for a given source address.
    #[must_use]
    pub fn pool(&self, source: IpAddr) -> Option<Arc<ClientPool>> {
        self.pools.get(&source).cloned()
    }

    /// Whether STARTTLS should still be attempted against this host.
    #[must_use]
    pub fn use_tls(&self) -> bool {
        self.use_tls.load(Ordering::Acquire)
    }

    /// Gives up on TLS for this host for the rest of the process.
    pub fn dont_use_tls(&self) {
        self.use_tls.store(false, Ordering::Release);
    }

    /// Folds the EHLO advertisement into the latch. Only ever narrows:
    /// once off, an advertisement cannot turn TLS back on.
    pub fn refresh_tls_support(&self, advertised: bool) {
        if !advertised {
            self.dont_use_tls();
        }
    }

    /// Id for the next session created against this host: one past every
    /// session accounted across all source pools.
    #[must_use]
    pub fn next_client_id(&self) -> usize {
        self.pools.values().map(|pool| pool.size()).sum::<usize>() + 1
    }

    /// Address to dial, preferring the resolved A records.
    #[must_use]
    pub fn dial_addr(&self) -> Option<SocketAddr> {
        self.ips
            .first()
            .map(|ip| SocketAddr::new(IpAddr::V4(*ip), self.port))
    }

    fn cull_expired(&self, waiting: Duration) -> usize {
        self.pools
            .values()
            .map(|pool| pool.cull_expired(waiting))
            .sum()
    }
}

/// Where a destination's lookup currently stands.
#[derive(Clone)]
pub enum RouteState {
    /// Some worker is resolving; poll again shortly.
    Pending,
    /// Resolved MX hosts in priority order.
    Ready(Arc<Vec<Arc<MxHost>>>),
    /// Resolution failed; the destination is undeliverable.
    Failed,
}

/// Cache record for one destination hostname.
pub struct MailServer {
    /// Worker that owns the lookup, for logs.
    owner: usize,
    state: Mutex<RouteState>,
}

impl MailServer {
    fn new(owner: usize) -> Self {
        Self {
            owner,
            state: Mutex::new(RouteState::Pending),
        }
    }

    #[must_use]
    pub fn state(&self) -> RouteState {
        self.state.lock().clone()
    }

    fn set_ready(&self, hosts: Vec<Arc<MxHost>>) {
        *self.state.lock() = RouteState::Ready(Arc::new(hosts));
    }

    fn set_failed(&self) {
        *self.state.lock() = RouteState::Failed;
    }
}

/// The resolver stage's shared state: cache plus the actual DNS client.
pub struct Seeker {
    servers: DashMap<Domain, Arc<MailServer>>,
    resolver: TokioResolver,
    sources: Vec<IpAddr>,
}

impl Seeker {
    /// Builds a seeker on the system resolver configuration, falling back
    /// to a public resolver when the system one cannot be read.
    #[must_use]
    pub fn new(sources: Vec<IpAddr>) -> Self {
        let opts = ResolverOpts::default();
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map(|builder| builder.with_options(opts.clone()).build())
            .unwrap_or_else(|error| {
                tracing::warn!(%error, "can't read system dns config, using cloudflare");
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
                .with_options(opts)
                .build()
            });

        Self {
            servers: DashMap::new(),
            resolver,
            sources,
        }
    }

    /// Looks up (or joins the lookup of) the route for a hostname.
    ///
    /// The caller that finds no cache entry becomes the owner and resolves
    /// inline; every other caller gets the current state back and is
    /// expected to poll while it is [`RouteState::Pending`].
    pub async fn route(&self, worker: usize, hostname: &Domain) -> RouteState {
        let mut owned = false;
        let server = match self.servers.entry(hostname.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                owned = true;
                let server = Arc::new(MailServer::new(worker));
                entry.insert(server.clone());
                server
            }
        };

        if owned {
            tracing::debug!(worker, %hostname, "looking up mx hosts");
            match self.resolve(worker, hostname).await {
                Ok(hosts) => {
                    tracing::debug!(worker, %hostname, hosts = hosts.len(), "lookup finished");
                    server.set_ready(hosts);
                }
                Err(error) => {
                    tracing::warn!(worker, %hostname, %error, "can't look up mx hosts");
                    server.set_failed();
                }
            }
        }

        server.state()
    }

    /// Pre-populates the cache. Lets operators pin a route and keeps the
    /// test suite off the network.
    pub fn seed(&self, hostname: Domain, hosts: Vec<Arc<MxHost>>) {
        let server = MailServer::new(0);
        server.set_ready(hosts);
        self.servers.insert(hostname, Arc::new(server));
    }

    /// Drops a cached route so the next message re-resolves it. Returns
    /// whether anything was cached.
    pub fn forget(&self, hostname: &Domain) -> bool {
        self.servers.remove(hostname).is_some()
    }

    /// Tears down expired idle sessions across every known route. Returns
    /// how many were culled.
    pub fn sweep_idle(&self, waiting: Duration) -> usize {
        let mut culled = 0;
        for entry in &self.servers {
            if let RouteState::Ready(hosts) = entry.value().state() {
                culled += hosts
                    .iter()
                    .map(|host| host.cull_expired(waiting))
                    .sum::<usize>();
            }
        }
        culled
    }

    async fn resolve(
        &self,
        worker: usize,
        hostname: &Domain,
    ) -> Result<Vec<Arc<MxHost>>, ResolveError> {
        let mx_lookup = self.resolver.mx_lookup(hostname.as_str()).await?;

        let mut records: Vec<(u16, Domain)> = mx_lookup
            .iter()
            .map(|mx| (mx.preference(), Domain::from_dns(&mx.exchange().to_utf8())))
            .collect();
        records.sort_by_key(|(preference, _)| *preference);

        let mut hosts = Vec::with_capacity(records.len());
        for (_, mx_hostname) in records {
            let ips = self.lookup_ipv4(worker, &mx_hostname).await;
            let ptrs = self.lookup_ptrs(worker, &ips).await;
            let real_server_name = pick_real_server_name(hostname, &mx_hostname, &ptrs);
            tracing::debug!(
                worker,
                mx = %mx_hostname,
                real = %real_server_name,
                ips = ips.len(),
                "mx host resolved"
            );
            hosts.push(Arc::new(MxHost::new(
                mx_hostname,
                ips,
                real_server_name,
                SMTP_PORT,
                &self.sources,
            )));
        }

        Ok(hosts)
    }

    /// IPv4 addresses of one MX host, deduplicated, order preserved. A
    /// failed address lookup degrades the host, it does not fail the route.
    async fn lookup_ipv4(&self, worker: usize, mx_hostname: &Domain) -> Vec<Ipv4Addr> {
        match self.resolver.ipv4_lookup(mx_hostname.as_str()).await {
            Ok(lookup) => {
                let mut ips: Vec<Ipv4Addr> = Vec::new();
                for record in lookup.iter() {
                    if !ips.contains(&record.0) {
                        ips.push(record.0);
                    }
                }
                ips
            }
            Err(error) => {
                tracing::warn!(worker, mx = %mx_hostname, %error, "can't look up ips");
                Vec::new()
            }
        }
    }

    /// PTR names for a set of addresses, IP literals filtered out.
    async fn lookup_ptrs(&self, worker: usize, ips: &[Ipv4Addr]) -> Vec<Domain> {
        let mut ptrs = Vec::new();
        for ip in ips {
            match self.resolver.reverse_lookup(IpAddr::V4(*ip)).await {
                Ok(lookup) => {
                    for ptr in lookup.iter() {
                        let name = ptr.0.to_utf8();
                        let name = name.trim_end_matches('.');
                        if name.parse::<IpAddr>().is_err() {
                            ptrs.push(Domain::new(name));
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(worker, %ip, %error, "can't look up ptr");
                }
            }
        }
        ptrs
    }
}

/// Chooses the name the TLS certificate is expected to carry.
///
/// First PTR name that decides wins: when the mailbox domain shows up in
/// the MX name but the MX name is absent from the PTR, the PTR is the real
/// machine; when the MX name shows up in the PTR, or nothing matches at
/// all, the MX name is as real as it gets. A PTR containing both decides
/// nothing and the scan moves on.
fn pick_real_server_name(mailbox: &Domain, mx_hostname: &Domain, ptrs: &[Domain]) -> Domain {
    for ptr in ptrs {
        let mailbox_in_mx = mx_hostname.contains(mailbox.as_str());
        let mx_in_ptr = ptr.contains(mx_hostname.as_str());
        if mailbox_in_mx && !mx_in_ptr {
            return ptr.clone();
        }
        if !mailbox_in_mx {
            return mx_hostname.clone();
        }
    }
    mx_hostname.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(names: &[&str]) -> Vec<Domain> {
        names.iter().map(|name| Domain::new(name)).collect()
    }

    #[test]
    fn test_ptr_wins_when_mx_carries_the_mailbox_domain() {
        // mx.dest.tld contains dest.tld, PTR is a different machine
        let name = pick_real_server_name(
            &Domain::new("dest.tld"),
            &Domain::new("mx.dest.tld"),
            &domains(&["edge7.hoster.example"]),
        );
        assert_eq!(name, Domain::new("edge7.hoster.example"));
    }

    #[test]
    fn test_mx_wins_when_it_does_not_carry_the_mailbox_domain() {
        let name = pick_real_server_name(
            &Domain::new("dest.tld"),
            &Domain::new("aspmx.l.google.example"),
            &domains(&["edge7.hoster.example"]),
        );
        assert_eq!(name, Domain::new("aspmx.l.google.example"));
    }

    #[test]
    fn test_undecided_ptr_moves_to_the_next() {
        // first PTR contains the MX name while the MX carries the mailbox
        // domain: undecided, second PTR decides
        let name = pick_real_server_name(
            &Domain::new("dest.tld"),
            &Domain::new("mx.dest.tld"),
            &domains(&["edge.mx.dest.tld", "edge7.hoster.example"]),
        );
        assert_eq!(name, Domain::new("edge7.hoster.example"));
    }

    #[test]
    fn test_no_ptrs_falls_back_to_the_mx_name() {
        let name = pick_real_server_name(
            &Domain::new("dest.tld"),
            &Domain::new("mx.dest.tld"),
            &[],
        );
        assert_eq!(name, Domain::new("mx.dest.tld"));
    }

    #[test]
    fn test_tls_latch_is_monotonic() {
        let host = MxHost::new(
            Domain::new("mx.dest.tld"),
            vec![],
            Domain::new("mx.dest.tld"),
            SMTP_PORT,
            &["127.0.0.1".parse().unwrap()],
        );
        assert!(host.use_tls());
        host.refresh_tls_support(true);
        assert!(host.use_tls());
        host.dont_use_tls();
        host.refresh_tls_support(true);
        assert!(!host.use_tls(), "an advertisement must not unlatch tls");
    }

    #[test]
    fn test_client_ids_count_across_source_pools() {
        let sources: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let host = MxHost::new(
            Domain::new("mx.dest.tld"),
            vec![],
            Domain::new("mx.dest.tld"),
            SMTP_PORT,
            &sources,
        );
        assert_eq!(host.next_client_id(), 1);
        host.pool(sources[0]).unwrap().grow();
        host.pool(sources[1]).unwrap().grow();
        assert_eq!(host.next_client_id(), 3);
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn test_route_against_real_dns() {
        let seeker = Seeker::new(vec!["0.0.0.0".parse().unwrap()]);
        let state = seeker.route(1, &Domain::new("gmail.com")).await;
        assert!(matches!(state, RouteState::Ready(hosts) if !hosts.is_empty()));
    }
}
