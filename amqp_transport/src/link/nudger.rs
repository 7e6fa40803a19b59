/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Credit nudging for blocked senders.
//!
//! A sender link with queued messages and no credit registers itself with
//! a [`CreditNudger`]. A periodic task asks each registered link to send
//! an echoing Flow, backing off exponentially per link (2s, 4s, 8s, ...,
//! capped) until the link reports it is no longer blocked or goes away.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::init::get_runtime;

/// Something that can ask its peer for credit.
pub(crate) trait CreditRequester: Send + Sync + 'static {
    /// Send a credit request if still blocked. Returns whether it was
    /// still blocked.
    fn request_credit(&self) -> bool;
}

struct Entry {
    requester: Weak<dyn CreditRequester>,
    backoff: ExponentialBackoff,
    next_at: Instant,
    nudges: u32,
}

struct Inner {
    entries: DashMap<u64, Entry>,
    initial_interval: Duration,
    max_interval: Duration,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    fn nudge_due(&self, now: Instant) {
        // Requesters may call back into the nudger, so no map references
        // are held while they run.
        let due: Vec<(u64, Weak<dyn CreditRequester>)> = self
            .entries
            .iter()
            .filter(|entry| entry.next_at <= now)
            .map(|entry| (*entry.key(), entry.requester.clone()))
            .collect();

        for (id, requester) in due {
            let still_blocked = match requester.upgrade() {
                Some(requester) => requester.request_credit(),
                None => false,
            };
            if !still_blocked {
                self.entries.remove(&id);
                continue;
            }
            if let Some(mut entry) = self.entries.get_mut(&id) {
                let delay = next_delay(&mut entry.backoff, self.max_interval);
                entry.next_at = now + delay;
                entry.nudges += 1;
                tracing::debug!(
                    link = id,
                    nudges = entry.nudges,
                    next = %humantime::format_duration(delay),
                    "nudged blocked sender"
                );
            }
        }
    }
}

// The backoff adds up to a nanosecond of jitter even without
// randomization; whole milliseconds keep nudges aligned with ticks.
fn next_delay(backoff: &mut ExponentialBackoff, max_interval: Duration) -> Duration {
    let delay = backoff.next_backoff().unwrap_or(max_interval);
    Duration::from_millis(delay.as_millis() as u64)
}

/// Periodically asks blocked sender links for credit. Cloning yields
/// another handle to the same nudger; the task stops when the last handle
/// is dropped or [`CreditNudger::shutdown`] is called.
#[derive(Clone)]
pub struct CreditNudger {
    inner: Arc<Inner>,
}

impl fmt::Debug for CreditNudger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreditNudger")
            .field("tracked", &self.tracked())
            .finish()
    }
}

impl CreditNudger {
    /// Start a nudger using the intervals in `config`.
    pub fn start(config: &Config) -> Self {
        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            initial_interval: config.nudge_initial_interval,
            max_interval: config.nudge_max_interval,
            cancel: CancellationToken::new(),
        });
        get_runtime().spawn(run(
            Arc::downgrade(&inner),
            config.nudge_tick,
            inner.cancel.clone(),
        ));
        Self { inner }
    }

    /// Track `id` as blocked. Has no effect if it is already tracked.
    pub(crate) fn blocked(&self, id: u64, requester: Weak<dyn CreditRequester>) {
        self.inner.entries.entry(id).or_insert_with(|| {
            let mut backoff = self.inner.backoff();
            let delay = next_delay(&mut backoff, self.inner.max_interval);
            tracing::debug!(link = id, "tracking blocked sender");
            Entry {
                requester,
                backoff,
                next_at: Instant::now() + delay,
                nudges: 0,
            }
        });
    }

    /// Stop tracking `id`, e.g. because credit arrived or the link went
    /// away.
    pub(crate) fn clear(&self, id: u64) {
        if self.inner.entries.remove(&id).is_some() {
            tracing::debug!(link = id, "stopped tracking sender");
        }
    }

    /// Number of tracked senders.
    pub fn tracked(&self) -> usize {
        self.inner.entries.len()
    }

    /// Stop the nudging task and forget every sender.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.entries.clear();
    }
}

async fn run(inner: Weak<Inner>, tick: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => (),
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.nudge_due(Instant::now());
    }
    tracing::debug!("credit nudger stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    use super::*;

    struct Blocked {
        start: Instant,
        blocked: AtomicBool,
        requests: Mutex<Vec<Duration>>,
    }

    impl Blocked {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                blocked: AtomicBool::new(true),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl CreditRequester for Blocked {
        fn request_credit(&self) -> bool {
            let blocked = self.blocked.load(Ordering::SeqCst);
            if blocked {
                self.requests.lock().unwrap().push(self.start.elapsed());
            }
            blocked
        }
    }

    fn config() -> Config {
        Config {
            nudge_initial_interval: Duration::from_secs(2),
            nudge_max_interval: Duration::from_secs(10),
            nudge_tick: Duration::from_millis(100),
            ..Config::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule() {
        let nudger = CreditNudger::start(&config());
        let link = Blocked::new();
        let requester: Arc<dyn CreditRequester> = link.clone();
        nudger.blocked(1, Arc::downgrade(&requester));
        // Registering twice keeps the first schedule.
        nudger.blocked(1, Arc::downgrade(&requester));

        tokio::time::sleep(Duration::from_millis(37_050)).await;
        let requests: Vec<u64> = link
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|elapsed| elapsed.as_millis() as u64 / 100)
            .collect();
        // 2s, then 4s, 8s, then capped at 10s.
        assert_eq!(requests, vec![20, 60, 140, 240, 340]);

        link.blocked.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(nudger.tracked(), 0);
        assert_eq!(link.requests.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_dropped_requester() {
        let nudger = CreditNudger::start(&config());
        let kept = Blocked::new();
        let kept_requester: Arc<dyn CreditRequester> = kept.clone();
        nudger.blocked(1, Arc::downgrade(&kept_requester));
        nudger.clear(1);

        let dropped: Arc<dyn CreditRequester> = Blocked::new();
        nudger.blocked(2, Arc::downgrade(&dropped));
        drop(dropped);
        assert_eq!(nudger.tracked(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(nudger.tracked(), 0);
        assert!(kept.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown() {
        let nudger = CreditNudger::start(&config());
        let link = Blocked::new();
        let requester: Arc<dyn CreditRequester> = link.clone();
        nudger.blocked(1, Arc::downgrade(&requester));
        nudger.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(link.requests.lock().unwrap().is_empty());
    }
}
