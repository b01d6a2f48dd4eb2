//! Process-wide CSPRNG

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Thread-safe random source seeded from the OS.
pub struct SecureRandom {
    inner: Mutex<StdRng>,
}

impl SecureRandom {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn fill(&self, buf: &mut [u8]) {
        self.inner.lock().fill_bytes(buf);
    }

    pub fn array<const N: usize>(&self) -> [u8; N] {
        let mut a = [0u8; N];
        self.fill(&mut a);
        a
    }

    /// Uniform in `0..n`. Returns 0 for `n == 0`.
    pub fn range(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.inner.lock().random_range(0..n)
    }

    pub fn u64(&self) -> u64 {
        self.inner.lock().next_u64()
    }
}

impl Default for SecureRandom {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let rng = SecureRandom::new();
        for _ in 0..1000 {
            assert!(rng.range(4) < 4);
        }
        assert_eq!(rng.range(0), 0);
    }

    #[test]
    fn test_bytes_not_constant() {
        let rng = SecureRandom::new();
        assert_ne!(rng.array::<32>(), rng.array::<32>());
    }
}
