//! Per-connection input throttling.
//!
//! A fixed-window counter: each connection gets `max` messages per window,
//! and the window restarts on the first message after it lapses. A burst that
//! straddles a boundary can therefore see up to `2 * max` messages accepted
//! in quick succession. That approximation is deliberate and matches how the
//! limit has always behaved for clients.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter<K> {
    windows: Mutex<HashMap<K, Window>>,
    sweep_interval: Duration,
}

impl<K: Hash + Eq + Clone + Send + 'static> RateLimiter<K> {
    /// Entries whose window lapsed more than `sweep_interval` ago are dropped
    /// by [`sweep_at`](Self::sweep_at).
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            sweep_interval,
        }
    }

    pub fn allow(&self, key: &K, window: Duration, max: u32) -> bool {
        self.allow_at(key, window, max, Instant::now())
    }

    pub fn allow_at(&self, key: &K, window: Duration, max: u32, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        match windows.get_mut(key) {
            Some(w) if now <= w.reset_at => {
                if w.count >= max {
                    return false;
                }
                w.count += 1;
                true
            }
            _ => {
                windows.insert(
                    key.clone(),
                    Window {
                        count: 1,
                        reset_at: now + window,
                    },
                );
                true
            }
        }
    }

    /// Drop the entry for a connection that went away.
    pub fn forget(&self, key: &K) {
        self.windows.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries whose window expired more than one sweep interval ago.
    /// Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let grace = self.sweep_interval;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now <= w.reset_at + grace);
        before - windows.len()
    }

    /// Start the periodic sweep. The sweep stops when the returned handle is
    /// stopped or dropped.
    pub fn start(self: &Arc<Self>) -> SweeperHandle
    where
        K: Sync,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let limiter = Arc::clone(self);
        let period = self.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_at(Instant::now());
                        if removed > 0 {
                            tracing::debug!(removed, "swept stale rate-limit windows");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
        SweeperHandle {
            cancel,
            task: Some(task),
        }
    }
}

/// Owns a background sweep task; cancels it on [`stop`](Self::stop) or drop.
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub(crate) fn from_parts(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1000);

    fn limiter() -> RateLimiter<u64> {
        RateLimiter::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn admits_up_to_max_then_denies() {
        let rl = limiter();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(rl.allow_at(&1, WINDOW, 5, now));
        }
        assert!(!rl.allow_at(&1, WINDOW, 5, now));
        assert!(!rl.allow_at(&1, WINDOW, 5, now + Duration::from_millis(999)));
    }

    #[tokio::test]
    async fn denial_does_not_extend_count() {
        let rl = limiter();
        let now = Instant::now();
        assert!(rl.allow_at(&1, WINDOW, 1, now));
        for _ in 0..10 {
            assert!(!rl.allow_at(&1, WINDOW, 1, now));
        }
        assert!(rl.allow_at(&1, WINDOW, 1, now + WINDOW + Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn window_resets_after_elapsing() {
        let rl = limiter();
        let now = Instant::now();
        assert!(rl.allow_at(&1, WINDOW, 2, now));
        assert!(rl.allow_at(&1, WINDOW, 2, now));
        assert!(!rl.allow_at(&1, WINDOW, 2, now));
        // Exactly at the reset instant the old window still applies.
        assert!(!rl.allow_at(&1, WINDOW, 2, now + WINDOW));
        assert!(rl.allow_at(&1, WINDOW, 2, now + WINDOW + Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn boundary_burst_admits_double() {
        let rl = limiter();
        let start = Instant::now();
        let late = start + Duration::from_millis(990);
        let after = start + Duration::from_millis(1010);
        assert!(rl.allow_at(&1, WINDOW, 3, start));
        assert!(rl.allow_at(&1, WINDOW, 3, late));
        assert!(rl.allow_at(&1, WINDOW, 3, late));
        for _ in 0..3 {
            assert!(rl.allow_at(&1, WINDOW, 3, after));
        }
        assert!(!rl.allow_at(&1, WINDOW, 3, after));
    }

    #[tokio::test]
    async fn connections_are_independent() {
        let rl = limiter();
        let now = Instant::now();
        assert!(rl.allow_at(&1, WINDOW, 1, now));
        assert!(!rl.allow_at(&1, WINDOW, 1, now));
        assert!(rl.allow_at(&2, WINDOW, 1, now));
    }

    #[tokio::test]
    async fn forget_releases_state() {
        let rl = limiter();
        let now = Instant::now();
        assert!(rl.allow_at(&7, WINDOW, 1, now));
        assert_eq!(rl.len(), 1);
        rl.forget(&7);
        assert!(rl.is_empty());
        assert!(rl.allow_at(&7, WINDOW, 1, now));
    }

    #[tokio::test]
    async fn sweep_keeps_entries_within_grace() {
        let rl = limiter();
        let now = Instant::now();
        rl.allow_at(&1, WINDOW, 1, now);
        rl.allow_at(&2, WINDOW, 1, now + Duration::from_secs(120));

        assert_eq!(rl.sweep_at(now + WINDOW + Duration::from_secs(30)), 0);
        assert_eq!(rl.sweep_at(now + WINDOW + Duration::from_secs(61)), 1);
        assert_eq!(rl.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_until_stopped() {
        let rl = Arc::new(RateLimiter::<u64>::new(Duration::from_secs(60)));
        rl.allow(&1, WINDOW, 10);
        let handle = rl.start();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(rl.len(), 1);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert!(rl.is_empty());

        handle.stop().await;
        rl.allow(&2, WINDOW, 10);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(rl.len(), 1);
    }
}
