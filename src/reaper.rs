//! Reclaims sessions nobody is watching.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::rate_limit::SweeperHandle;
use crate::session::{SessionId, SessionRegistry};

/// Remove every session that has no viewers and has been idle for longer
/// than `idle_timeout` as of `now`. Returns the ids that were removed.
///
/// Sessions that vanish or gain a viewer mid-sweep are left alone.
pub fn sweep(registry: &SessionRegistry, now: Instant, idle_timeout: Duration) -> Vec<SessionId> {
    registry
        .ids()
        .into_iter()
        .filter(|id| registry.reap_if_idle(id, now, idle_timeout))
        .inspect(|id| tracing::info!(session = %id, "reaped idle terminal"))
        .collect()
}

pub type ReaperHandle = SweeperHandle;

pub struct IdleReaper;

impl IdleReaper {
    /// Run [`sweep`] every `interval` until the handle is stopped or dropped.
    /// Each tick also writes live buffers through to the store.
    pub fn start(registry: SessionRegistry, interval: Duration, idle_timeout: Duration) -> ReaperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = sweep(&registry, Instant::now(), idle_timeout);
                        if !reaped.is_empty() {
                            tracing::debug!(count = reaped.len(), "idle sweep finished");
                        }
                        registry.snapshot_buffers();
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
        SweeperHandle::from_parts(cancel, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::session::tests::{harness, harness_with, settle};
    use crate::session::{CloseReason, ViewerId};

    const IDLE: Duration = Duration::from_secs(30 * 60);

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_watched_and_recent_sessions() {
        let h = harness();
        let watched = h.registry.create("deck-1", None).unwrap();
        let idle = h.registry.create("deck-1", None).unwrap();
        let _rx = h.registry.get(&watched.id).unwrap().attach(ViewerId::next()).unwrap();

        let now = Instant::now();
        assert!(sweep(&h.registry, now, IDLE).is_empty());
        // Exactly at the timeout is not yet idle.
        assert!(sweep(&h.registry, now + IDLE, IDLE).is_empty());

        let reaped = sweep(&h.registry, now + IDLE + Duration::from_millis(1), IDLE);
        assert_eq!(reaped, vec![idle.id]);
        assert!(h.registry.get(&watched.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_reaping() {
        let h = harness();
        let info = h.registry.create("deck-1", None).unwrap();
        let start = Instant::now();

        tokio::time::advance(IDLE - Duration::from_secs(1)).await;
        h.spawner.last().emit("tick\n").await;
        settle().await;

        let later = start + IDLE + Duration::from_secs(1);
        assert!(sweep(&h.registry, later, IDLE).is_empty());
        assert!(h.registry.get(&info.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_tolerates_vanished_sessions() {
        let h = harness();
        let info = h.registry.create("deck-1", None).unwrap();
        h.registry.stop(&info.id.to_string()).unwrap();
        let now = Instant::now() + IDLE * 2;
        assert!(sweep(&h.registry, now, IDLE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_reaper_removes_idle_sessions() {
        let h = harness_with(EngineConfig {
            idle_timeout_secs: 120,
            reap_interval_secs: 60,
            ..Default::default()
        });
        let config = h.registry.config().clone();
        let info = h.registry.create("deck-1", None).unwrap();
        let handle = IdleReaper::start(h.registry.clone(), config.reap_interval(), config.idle_timeout());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.registry.get(&info.id).is_some());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.registry.get(&info.id).is_none());
        assert!(h.spawner.last().killed());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tick_snapshots_buffers() {
        let h = harness();
        let info = h.registry.create("deck-1", None).unwrap();
        h.spawner.last().emit("persist me").await;
        settle().await;

        let handle = IdleReaper::start(h.registry.clone(), Duration::from_secs(60), IDLE);
        tokio::time::sleep(Duration::from_secs(61)).await;
        h.registry.flush_store().await;
        assert_eq!(h.store.get(&info.id.to_string()).unwrap().buffer, b"persist me");
        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_never_reaps_a_session_that_just_gained_a_viewer() {
        let h = harness();
        for _ in 0..2000 {
            let info = h.registry.create("deck-1", None).unwrap();
            let session = h.registry.get(&info.id).unwrap();
            let attach = std::thread::spawn(move || session.attach(ViewerId::next()).ok());
            let reaped = sweep(&h.registry, Instant::now(), Duration::ZERO);
            match attach.join().unwrap() {
                Some(mut rx) => {
                    assert!(reaped.is_empty(), "reaped a session with a viewer");
                    assert!(rx.try_recv().is_err());
                    assert!(h.registry.remove(&info.id, CloseReason::Stopped));
                }
                // Lost the race cleanly: the session was closed before attach.
                None => assert_eq!(reaped, vec![info.id]),
            }
        }
        assert!(h.registry.is_empty());
    }
}
