//! Process-wide counters and the anti-replay cache

pub mod bloom;
pub mod replay;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

pub use replay::ReplayChecker;

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Lock-free counters, read as a [`StatsSnapshot`].
        #[derive(Debug)]
        pub struct Stats {
            started: Instant,
            $($name: AtomicU64,)*
        }

        #[derive(Debug, Clone, Serialize)]
        pub struct StatsSnapshot {
            pub uptime_secs: u64,
            $(pub $name: u64,)*
        }

        impl Stats {
            pub fn new() -> Self {
                Self {
                    started: Instant::now(),
                    $($name: AtomicU64::new(0),)*
                }
            }

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    uptime_secs: self.started.elapsed().as_secs(),
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    connects_all,
    connects_bad,
    handshake_timeouts,
    replays_detected,
    upstream_failures,
    session_panics,
    curr_connects,
    octets_from_client,
    octets_to_client,
    me_dials,
    me_evictions,
);

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn increment_connects_all(&self) {
        self.connects_all.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_connects_bad(&self) {
        self.connects_bad.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_handshake_timeouts(&self) {
        self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_replays_detected(&self) {
        self.replays_detected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_upstream_failures(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_session_panics(&self) {
        self.session_panics.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_me_dials(&self) {
        self.me_dials.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_me_evictions(&self) {
        self.me_evictions.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_octets_from_client(&self, n: u64) {
        self.octets_from_client.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_octets_to_client(&self, n: u64) {
        self.octets_to_client.fetch_add(n, Ordering::Relaxed);
    }

    /// Count a live session until the guard drops.
    pub fn session_guard(self: &Arc<Self>) -> SessionGuard {
        self.curr_connects.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            stats: Arc::clone(self),
        }
    }
}

pub struct SessionGuard {
    stats: Arc<Stats>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.curr_connects.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Log a JSON snapshot every `interval`.
pub async fn run_stats_logger(stats: Arc<Stats>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match serde_json::to_string(&stats.snapshot()) {
            Ok(json) => info!(target: "mtrelay::stats", "{}", json),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize stats"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_guard() {
        let stats = Arc::new(Stats::new());
        stats.increment_connects_all();
        stats.add_octets_from_client(10);
        {
            let _g = stats.session_guard();
            assert_eq!(stats.snapshot().curr_connects, 1);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.connects_all, 1);
        assert_eq!(snap.octets_from_client, 10);
        assert_eq!(snap.curr_connects, 0);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["connects_all"], 1);
    }
}
