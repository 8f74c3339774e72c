use serde::{Deserialize, Serialize};

/// Small reproducible RNG driving edit generation and server faults.
///
/// A PCG-style LCG step; the same seed yields the same stream on every
/// platform, which is what makes a failing seed replayable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    /// Independent stream for another component, derived from the same seed.
    #[must_use]
    pub const fn fork(seed: u64, stream: u64) -> Self {
        Self::new(seed.wrapping_add(stream.wrapping_mul(0xA076_1D64_78BD_642F)))
    }

    pub const fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.state
    }

    /// Next value in `[0, upper_exclusive)`; always 0 for an empty range.
    pub const fn next_bounded(&mut self, upper_exclusive: u64) -> u64 {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u64() >> 16) % upper_exclusive
    }

    /// Next index into a slice of `len` items.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn next_index(&mut self, len: usize) -> usize {
        self.next_bounded(len as u64) as usize
    }

    /// Bernoulli trial with an integer percentage.
    pub const fn hit_rate_percent(&mut self, percent: u8) -> bool {
        match percent {
            0 => false,
            100.. => true,
            p => self.next_bounded(100) < p as u64,
        }
    }
}
