//! Anti-replay checker for handshake fingerprints

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::info;

use super::bloom::StableBloomFilter;
use crate::config::{AntiReplayConfig, ReplayBackend};
use crate::protocol::obfuscation::{Fingerprint, FINGERPRINT_LEN};

/// Rejects handshakes whose fingerprint was seen recently.
///
/// `seen_before` records the digest and reports whether it was already
/// present; under concurrent calls with the same digest at most one caller
/// gets `false`.
pub enum ReplayChecker {
    Noop,
    Bloom(StableBloomFilter),
    Cache(TtlCache),
}

impl ReplayChecker {
    pub fn from_config(cfg: &AntiReplayConfig) -> Self {
        let checker = match cfg.backend {
            ReplayBackend::None => ReplayChecker::Noop,
            ReplayBackend::Bloom => ReplayChecker::Bloom(StableBloomFilter::new(
                cfg.bloom_size_bytes,
                cfg.bloom_error_rate,
            )),
            ReplayBackend::Cache => ReplayChecker::Cache(TtlCache::new(
                cfg.cache_capacity,
                cfg.cache_shards,
                Duration::from_secs(cfg.cache_ttl_secs),
            )),
        };
        info!(backend = checker.name(), "Anti-replay initialized");
        checker
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplayChecker::Noop => "none",
            ReplayChecker::Bloom(_) => "bloom",
            ReplayChecker::Cache(_) => "cache",
        }
    }

    pub fn seen_before(&self, digest: &[u8]) -> bool {
        match self {
            ReplayChecker::Noop => false,
            ReplayChecker::Bloom(filter) => filter.test_and_add(digest),
            ReplayChecker::Cache(cache) => cache.test_and_add(&to_fingerprint(digest)),
        }
    }
}

fn to_fingerprint(digest: &[u8]) -> Fingerprint {
    let mut fp = [0u8; FINGERPRINT_LEN];
    let n = digest.len().min(FINGERPRINT_LEN);
    fp[..n].copy_from_slice(&digest[..n]);
    fp
}

/// Sharded LRU of fingerprints with a retention window.
pub struct TtlCache {
    shards: Vec<Mutex<LruCache<Fingerprint, Instant>>>,
    ttl: Duration,
}

impl TtlCache {
    pub fn new(capacity: usize, shards: usize, ttl: Duration) -> Self {
        let shard_count = shards.clamp(1, capacity.max(1));
        let per_shard = NonZeroUsize::new(capacity.div_ceil(shard_count)).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self { shards, ttl }
    }

    fn shard_for(&self, fp: &Fingerprint) -> &Mutex<LruCache<Fingerprint, Instant>> {
        let idx = u32::from_le_bytes([fp[0], fp[1], fp[2], fp[3]]) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn test_and_add(&self, fp: &Fingerprint) -> bool {
        self.test_and_add_at(fp, Instant::now())
    }

    fn test_and_add_at(&self, fp: &Fingerprint, now: Instant) -> bool {
        let mut shard = self.shard_for(fp).lock();

        // Expired entries sit at the cold end once nothing touches them.
        while let Some((_, &inserted)) = shard.peek_lru() {
            if now.saturating_duration_since(inserted) < self.ttl {
                break;
            }
            shard.pop_lru();
        }

        let live = shard
            .get(fp)
            .is_some_and(|&inserted| now.saturating_duration_since(inserted) < self.ttl);
        if live {
            return true;
        }
        shard.put(*fp, now);
        false
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fp(n: u8) -> Fingerprint {
        let mut f = [0u8; 16];
        f[0] = n;
        f[15] = n.wrapping_mul(7);
        f
    }

    #[test]
    fn test_noop_never_rejects() {
        let c = ReplayChecker::Noop;
        assert!(!c.seen_before(&fp(1)));
        assert!(!c.seen_before(&fp(1)));
    }

    #[test]
    fn test_cache_rejects_duplicate() {
        let cfg = AntiReplayConfig::default();
        let c = ReplayChecker::from_config(&cfg);
        assert_eq!(c.name(), "cache");
        assert!(!c.seen_before(&fp(1)));
        assert!(c.seen_before(&fp(1)));
        assert!(!c.seen_before(&fp(2)));
    }

    #[test]
    fn test_bloom_backend() {
        let cfg = AntiReplayConfig {
            backend: ReplayBackend::Bloom,
            bloom_size_bytes: 500,
            ..AntiReplayConfig::default()
        };
        let c = ReplayChecker::from_config(&cfg);
        assert!(!c.seen_before(&[1, 2, 3]));
        assert!(c.seen_before(&[1, 2, 3]));
        assert!(!c.seen_before(&[4, 5, 6]));
        assert!(c.seen_before(&[4, 5, 6]));
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = TtlCache::new(16, 2, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(!cache.test_and_add_at(&fp(1), t0));
        assert!(cache.test_and_add_at(&fp(1), t0 + Duration::from_secs(9)));
        // Past the window the fingerprint is treated as new again.
        assert!(!cache.test_and_add_at(&fp(1), t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_cache_prunes_expired_tail() {
        let cache = TtlCache::new(16, 1, Duration::from_secs(10));
        let t0 = Instant::now();
        for n in 0..5 {
            cache.test_and_add_at(&fp(n), t0);
        }
        assert_eq!(cache.len(), 5);
        cache.test_and_add_at(&fp(100), t0 + Duration::from_secs(20));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_capacity_bounded() {
        let cache = TtlCache::new(8, 1, Duration::from_secs(60));
        for n in 0..20 {
            cache.test_and_add(&fp(n));
        }
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn test_concurrent_duplicates_single_winner() {
        let c = Arc::new(ReplayChecker::from_config(&AntiReplayConfig::default()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                let accepted = accepted.clone();
                std::thread::spawn(move || {
                    if !c.seen_before(&fp(42)) {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
