//! Per-destination sending limits.
//!
//! Each configured destination gets a fixed window (`value` messages per
//! `duration`). The check increments an atomic counter; a separate cleaner
//! task resets stale windows once a second. The two race benignly: the
//! bound is approximate, at worst one message slips through or one spare
//! permit is dropped, and the retry path absorbs both.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use ahash::AHashMap;
use async_channel::Sender;
use parking_lot::Mutex;
use postrider_common::{config::LimitConfig, Binding, Domain, Signal};
use tokio::sync::broadcast;

use crate::event::{Disposition, SendEvent};

/// Cleaner cadence.
const CLEAN_INTERVAL: Duration = Duration::from_secs(1);

/// One destination's limit and its running window.
pub(crate) struct Limit {
    value: u32,
    duration: Duration,
    binding: Binding,
    current: AtomicU32,
    window: Mutex<Instant>,
}

impl Limit {
    fn new(config: &LimitConfig) -> Self {
        Self {
            value: config.value,
            duration: config.duration,
            binding: config.binding,
            current: AtomicU32::new(0),
            window: Mutex::new(Instant::now()),
        }
    }

    fn in_window(&self) -> bool {
        self.window.lock().elapsed() < self.duration
    }

    /// Resets the counter when the window has aged out. Cleaner-only.
    fn reset_if_stale(&self) -> bool {
        let mut window = self.window.lock();
        if window.elapsed() < self.duration {
            return false;
        }
        self.current.store(0, Ordering::Release);
        *window = Instant::now();
        true
    }
}

/// The limit-check stage plus its cleaner.
pub(crate) struct Limiter {
    limits: AHashMap<Domain, Limit>,
    next: Sender<SendEvent>,
}

impl Limiter {
    pub(crate) fn new(
        limits: &AHashMap<Domain, LimitConfig>,
        next: Sender<SendEvent>,
    ) -> Self {
        Self {
            limits: limits
                .iter()
                .map(|(hostname, config)| (hostname.clone(), Limit::new(config)))
                .collect(),
            next,
        }
    }

    pub(crate) async fn handle(&self, worker: usize, mut event: SendEvent) {
        if let Some(hostname) = event.message.hostname_to.clone() {
            if let Some(limit) = self.limits.get(&hostname) {
                // a stale window is the cleaner's to reset; until it does,
                // messages pass without touching the counter
                if limit.in_window() {
                    let current = limit.current.fetch_add(1, Ordering::AcqRel) + 1;
                    if current > limit.value {
                        tracing::info!(
                            worker,
                            mail = event.message.id,
                            %hostname,
                            current,
                            limit = limit.value,
                            "limit exceeded"
                        );
                        event.message.binding = limit.binding;
                        event.finish(Disposition::Overlimit);
                        return;
                    }
                }
            }
        }

        if self.next.send(event).await.is_err() {
            tracing::debug!(worker, "next stage is gone, dropping event");
        }
    }

    /// The cleaner: a single periodic worker that re-opens aged windows.
    pub(crate) async fn clean(&self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (hostname, limit) in &self.limits {
                        if limit.reset_if_stale() {
                            tracing::debug!(%hostname, "limit window reset");
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::MailMessage;

    use super::*;

    fn limiter(value: u32, duration: Duration) -> (Limiter, async_channel::Receiver<SendEvent>) {
        let mut limits = AHashMap::new();
        limits.insert(
            Domain::new("dest.tld"),
            LimitConfig {
                value,
                duration,
                binding: Binding::TenMinutes,
            },
        );
        let (next, next_rx) = async_channel::unbounded();
        (Limiter::new(&limits, next), next_rx)
    }

    fn message() -> MailMessage {
        MailMessage::new("a@ex.org", "b@dest.tld", "body")
    }

    #[tokio::test]
    async fn test_overflow_reroutes_to_the_limit_binding() {
        let (limiter, next_rx) = limiter(2, Duration::from_secs(60));

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (event, receiver) = SendEvent::new(message());
            limiter.handle(1, event).await;
            receivers.push(receiver);
        }

        // first two forwarded
        assert_eq!(next_rx.len(), 2);

        // third rerouted with the limit's binding
        let outcome = receivers.pop().unwrap().await.unwrap();
        assert_eq!(outcome.disposition, Disposition::Overlimit);
        assert_eq!(outcome.message.binding, Binding::TenMinutes);
        assert_eq!(outcome.republish_binding(), Some(Binding::TenMinutes));
    }

    #[tokio::test]
    async fn test_unlimited_hosts_pass() {
        let (limiter, next_rx) = limiter(1, Duration::from_secs(60));
        for _ in 0..5 {
            let (event, _receiver) =
                SendEvent::new(MailMessage::new("a@ex.org", "b@other.tld", "body"));
            limiter.handle(1, event).await;
        }
        assert_eq!(next_rx.len(), 5);
    }

    #[tokio::test]
    async fn test_stale_window_forwards_until_cleaned() {
        let (limiter, next_rx) = limiter(1, Duration::from_millis(10));

        let (event, _r1) = SendEvent::new(message());
        limiter.handle(1, event).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        // window aged out: messages pass without counting
        let (event, _r2) = SendEvent::new(message());
        limiter.handle(1, event).await;
        assert_eq!(next_rx.len(), 2);

        // the cleaner reopens the window and counting resumes
        let limit = limiter.limits.get(&Domain::new("dest.tld")).unwrap();
        assert!(limit.reset_if_stale());
        let (event, _r3) = SendEvent::new(message());
        limiter.handle(1, event).await;
        assert_eq!(next_rx.len(), 3);
        assert_eq!(limit.current.load(Ordering::Acquire), 1);
    }
}
