//! Deterministic randomness for the simulator.
//!
//! A plain 32-bit linear congruential generator (Numerical Recipes
//! constants). The sequence must be bit-for-bit reproducible from the seed,
//! so runs are comparable across machines and across reimplementations of
//! the harness.

/// 32-bit LCG: `state = state * 1664525 + 1013904223 (mod 2^32)`.
#[derive(Debug, Clone)]
pub struct Lcg32 {
    state: u32,
}

impl Lcg32 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed as u32 }
    }

    fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.state
    }

    /// Uniform draw in `[0, 1)` with 32 bits of state.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32()) / (u32::MAX as f64 + 1.0)
    }

    /// Uniform integer in `[min, max]`, inclusive on both ends. A reversed
    /// range collapses to `min`.
    pub fn int_in(&mut self, min: i64, max: i64) -> i64 {
        if max <= min {
            return min;
        }
        let span = (max - min + 1) as f64;
        min + (self.next_f64() * span) as i64
    }

    /// Fisher-Yates shuffle driven by this generator.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.int_in(0, i as i64) as usize;
            items.swap(i, j);
        }
    }
}
