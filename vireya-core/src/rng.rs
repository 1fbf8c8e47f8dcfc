//! Deterministic pseudo-random number generation.
//!
//! The whole engine shares one explicitly-injected [`Xorshift64`] generator;
//! given a fixed seed, every run is reproducible. There is no global random
//! state anywhere in the workspace.

/// Simple xorshift64 PRNG.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    /// Create a generator from `seed`. A zero seed is remapped to 1
    /// (xorshift has an all-zeroes fixed point).
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in \[lo, hi\]
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Uniform integer in `[0, max)`. `max` must be positive.
    pub fn sample_uint(&mut self, max: usize) -> usize {
        debug_assert!(max > 0, "sample_uint: max must be positive");
        let mut k = max;
        // next_f64 can return values arbitrarily close to 1; reject the
        // boundary draw rather than clamp it so every cell stays equiprobable.
        while k == max {
            k = (max as f64 * self.next_f64()) as usize;
        }
        k
    }
}
