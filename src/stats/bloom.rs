//! Stable Bloom filter (Deng & Rafiei) for unbounded streams
//!
//! One-bit cells. Every insert first clears `p` cells starting at a random
//! position, so old entries fade out and the false positive rate stays
//! bounded however many fingerprints pass through.

use parking_lot::Mutex;
use rand::Rng;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Bytes per shard above which the filter is split.
const SHARD_BYTES: usize = 64 * 1024;
const MAX_SHARDS: usize = 16;

fn fnv1a64(data: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Number of hash functions for a target false positive rate.
pub fn optimal_k(fp_rate: f64) -> usize {
    (1.0 / fp_rate).log2().ceil().max(1.0) as usize
}

/// Cells to decrement per insert so the filter stabilizes at `fp_rate`.
pub fn optimal_stable_p(m: usize, k: usize, d: u32, fp_rate: f64) -> usize {
    let max = 2f64.powi(d as i32) - 1.0;
    let sub_denom = (1.0 - fp_rate.powf(1.0 / k as f64)).powf(1.0 / max);
    let denom = (1.0 / sub_denom - 1.0) * (1.0 / k as f64 - 1.0 / m as f64);
    let p = (1.0 / denom) as usize;
    p.max(1)
}

struct Shard {
    cells: Vec<u8>,
    m: usize,
    k: usize,
    p: usize,
}

impl Shard {
    fn new(size_bytes: usize, fp_rate: f64) -> Self {
        let m = size_bytes.max(1) * 8;
        let k = optimal_k(fp_rate);
        Self {
            cells: vec![0u8; size_bytes.max(1)],
            m,
            k,
            p: optimal_stable_p(m, k, 1, fp_rate),
        }
    }

    fn get(&self, idx: usize) -> bool {
        self.cells[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set(&mut self, idx: usize) {
        self.cells[idx / 8] |= 1 << (idx % 8);
    }

    fn clear(&mut self, idx: usize) {
        self.cells[idx / 8] &= !(1 << (idx % 8));
    }

    fn indexes(&self, hash: u64) -> impl Iterator<Item = usize> + '_ {
        let lower = hash & 0xffff_ffff;
        let upper = hash >> 32;
        (0..self.k as u64).map(move |i| (lower.wrapping_add(upper.wrapping_mul(i)) % self.m as u64) as usize)
    }

    /// Test, decrement, then set. Returns whether every indexed cell was set.
    fn test_and_add(&mut self, hash: u64) -> bool {
        let seen = self.indexes(hash).all(|idx| self.get(idx));

        let start = rand::rng().random_range(0..self.m);
        for i in 0..self.p {
            self.clear((start + i) % self.m);
        }

        let idx: Vec<usize> = self.indexes(hash).collect();
        for i in idx {
            self.set(i);
        }
        seen
    }
}

pub struct StableBloomFilter {
    shards: Vec<Mutex<Shard>>,
}

impl StableBloomFilter {
    pub fn new(size_bytes: usize, fp_rate: f64) -> Self {
        let shard_count = (size_bytes / SHARD_BYTES).clamp(1, MAX_SHARDS);
        let per_shard = size_bytes / shard_count;
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new(per_shard, fp_rate)))
            .collect();
        Self { shards }
    }

    #[cfg(test)]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Record `data`; returns `true` if it was (probably) seen before.
    pub fn test_and_add(&self, data: &[u8]) -> bool {
        let hash = fnv1a64(data);
        // Shard from bits the bit indexes weigh least.
        let shard = (hash.rotate_right(17) as usize) % self.shards.len();
        self.shards[shard].lock().test_and_add(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters() {
        assert_eq!(optimal_k(0.001), 10);
        assert_eq!(optimal_stable_p(4000, 10, 1, 0.001), 9);
        let f = StableBloomFilter::new(500, 0.001);
        assert_eq!(f.shard_count(), 1);
        let shard = f.shards[0].lock();
        assert_eq!((shard.m, shard.k, shard.p), (4000, 10, 9));
    }

    #[test]
    fn test_seen_order() {
        let f = StableBloomFilter::new(500, 0.001);
        assert!(!f.test_and_add(&[1, 2, 3]));
        assert!(f.test_and_add(&[1, 2, 3]));
        assert!(!f.test_and_add(&[4, 5, 6]));
        assert!(f.test_and_add(&[4, 5, 6]));
    }

    #[test]
    fn test_sharded_large_filter() {
        let f = StableBloomFilter::new(1 << 20, 0.001);
        assert_eq!(f.shard_count(), MAX_SHARDS);
        let mut false_positives = 0;
        for i in 0u32..1000 {
            if f.test_and_add(&i.to_le_bytes()) {
                false_positives += 1;
            }
            // The cells just set are tested before any are cleared.
            assert!(f.test_and_add(&i.to_le_bytes()));
        }
        assert!(false_positives <= 10, "{false_positives} false positives in 1000");
    }

    #[test]
    fn test_fnv_known() {
        assert_eq!(fnv1a64(b""), FNV_OFFSET);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
