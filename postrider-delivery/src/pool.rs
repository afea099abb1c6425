//! Per-(MX, source-IP) connection pooling.
//!
//! Idle sessions are kept in a LIFO stack so the freshest connection is
//! reused first, which is what keeps keep-alive worth having. The pool's
//! capacity starts unknown and grows with every session the destination
//! accepts; the first refused creation latches the cap, and the periodic
//! sweep unlatches it again so a destination can regrow after a transient
//! outage.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use postrider_smtp::SmtpClient;

/// Lifecycle of one pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Checked out, carrying a transaction.
    Working,
    /// Idle in a pool, waiting for the next message.
    Waiting,
    /// Torn down; the next checkout discards it.
    Disconnected,
}

/// A live SMTP session plus the bookkeeping the pool needs.
///
/// Exclusivity is structural: a client is either inside one pool's idle
/// stack or owned by one in-flight event, never both.
pub struct PooledClient {
    /// Stable per-MX identifier, for logs.
    pub id: usize,
    /// The session itself.
    pub session: SmtpClient,
    state: ClientState,
    touched: Instant,
}

impl PooledClient {
    #[must_use]
    pub fn new(id: usize, session: SmtpClient) -> Self {
        Self {
            id,
            session,
            state: ClientState::Working,
            touched: Instant::now(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Parks the client before it goes back into its pool.
    pub fn wait(&mut self) {
        self.state = ClientState::Waiting;
        self.touched = Instant::now();
    }

    /// Puts a checked-out client back to work, cancelling its idle clock.
    pub fn wakeup(&mut self) {
        self.state = ClientState::Working;
        self.touched = Instant::now();
    }

    /// Marks the session dead. The connection itself closes on drop.
    pub fn close(&mut self) {
        self.state = ClientState::Disconnected;
    }

    /// Whether the idle clock has run out. An expired client is as good as
    /// disconnected: the peer has almost certainly dropped it already.
    #[must_use]
    pub fn is_expired(&self, waiting: Duration) -> bool {
        self.state == ClientState::Waiting && self.touched.elapsed() >= waiting
    }
}

/// Bounded LIFO of idle clients for one (MX host, source IP) pair.
pub struct ClientPool {
    idle: Mutex<Vec<PooledClient>>,
    /// Live sessions accounted to this pool, idle and checked out alike.
    size: AtomicUsize,
    /// Latched once the destination refuses a new session.
    limited: AtomicBool,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
            limited: AtomicBool::new(false),
        }
    }

    /// Freshest idle client, or `None` when every session is working or the
    /// pool is empty.
    #[must_use]
    pub fn pop(&self) -> Option<PooledClient> {
        self.idle.lock().pop()
    }

    /// Returns an idle client to the stack.
    pub fn push(&self, client: PooledClient) {
        self.idle.lock().push(client);
    }

    /// Number of idle clients right now.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Live sessions accounted to this pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Accounts a freshly created session.
    pub fn grow(&self) {
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    /// Un-accounts a dead session that was discarded at checkout.
    pub fn shrink(&self) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                size.checked_sub(1)
            });
    }

    /// Whether the cap is latched.
    #[must_use]
    pub fn has_limit(&self) -> bool {
        self.limited.load(Ordering::Acquire)
    }

    /// Latches the cap at the current size: the destination just refused a
    /// new session, so stop asking.
    pub fn latch_limit(&self) {
        self.limited.store(true, Ordering::Release);
    }

    /// Unlatches the cap so the pool can grow again.
    pub fn unlatch_limit(&self) {
        self.limited.store(false, Ordering::Release);
    }

    /// Tears down every idle client whose waiting clock has expired (or
    /// that is already dead) and returns how many were culled. Unlatches
    /// the cap when anything was culled, mirroring the recovery behavior
    /// after a destination-side outage.
    pub fn cull_expired(&self, waiting: Duration) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain_mut(|client| {
            let keep =
                client.state() != ClientState::Disconnected && !client.is_expired(waiting);
            if !keep {
                client.close();
            }
            keep
        });
        let culled = before - idle.len();
        drop(idle);

        if culled > 0 {
            for _ in 0..culled {
                self.shrink();
            }
            self.unlatch_limit();
        }
        culled
    }
}
