/// Idle-output monitor for one runner invocation.
///
/// Shared by the stdout and stderr scanners of a process. Every chunk either
/// of them receives pushes the deadline forward by the freeze timeout; when the
/// deadline passes with no reset, [`Watchdog::expired`] resolves and the
/// supervisor decides what the freeze means.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    epoch: Instant,
    timeout: Duration,
    /// Milliseconds since `epoch`.
    deadline_ms: AtomicU64,
}

impl Watchdog {
    /// Create an armed watchdog: it fires `timeout` from now unless reset.
    pub fn new(timeout: Duration) -> Self {
        let watchdog = Self {
            inner: Arc::new(Inner {
                epoch: Instant::now(),
                timeout,
                deadline_ms: AtomicU64::new(0),
            }),
        };
        watchdog.reset();
        watchdog
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Push the deadline to now + timeout. Safe to call from any thread.
    pub fn reset(&self) {
        let deadline = self.now_ms().saturating_add(millis(self.inner.timeout));
        // Concurrent resets from both streams must never move the deadline back.
        self.inner.deadline_ms.fetch_max(deadline, Ordering::AcqRel);
    }

    /// Start a new arming cycle after the watchdog fired.
    pub fn rearm(&self) {
        self.reset();
    }

    pub fn deadline_ms(&self) -> u64 {
        self.inner.deadline_ms.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.now_ms() >= self.deadline_ms()
    }

    /// Resolve once the deadline has passed without a reset.
    ///
    /// Resolves at most once per arming cycle: after it fires, a new wait only
    /// completes again once [`Watchdog::rearm`] (or a reset) has moved the
    /// deadline and that new deadline lapses.
    pub async fn expired(&self) {
        while !self.is_expired() {
            let at = self.inner.epoch + Duration::from_millis(self.deadline_ms());
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
        }
        tracing::debug!(
            timeout_ms = millis(self.inner.timeout),
            "watchdog deadline passed"
        );
    }

    fn now_ms(&self) -> u64 {
        millis(self.inner.epoch.elapsed())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_after_idle_timeout() {
        let watchdog = Watchdog::new(Duration::from_millis(50));
        let start = Instant::now();
        watchdog.expired().await;
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(watchdog.is_expired());
    }

    #[tokio::test]
    async fn test_resets_keep_it_alive() {
        let watchdog = Watchdog::new(Duration::from_millis(150));
        let feeder = watchdog.clone();
        let start = Instant::now();
        let feed = tokio::spawn(async move {
            for _ in 0..6 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                feeder.reset();
            }
        });
        watchdog.expired().await;
        // Last reset lands around 300ms, so expiry cannot come before ~450ms.
        assert!(start.elapsed() >= Duration::from_millis(400));
        feed.await.unwrap();
    }

    #[tokio::test]
    async fn test_rearm_starts_new_cycle() {
        let watchdog = Watchdog::new(Duration::from_millis(30));
        watchdog.expired().await;
        watchdog.rearm();
        assert!(!watchdog.is_expired());
        watchdog.expired().await;
        assert!(watchdog.is_expired());
    }

    #[test]
    fn test_reset_is_monotonic() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let first = watchdog.deadline_ms();
        watchdog.reset();
        assert!(watchdog.deadline_ms() >= first);
        assert_eq!(watchdog.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_reset_from_two_threads() {
        let watchdog = Watchdog::new(Duration::from_secs(1));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let w = watchdog.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        w.reset();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(!watchdog.is_expired());
    }
}
