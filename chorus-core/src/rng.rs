// ABOUTME: Injectable random source used by every probabilistic decision.
// ABOUTME: Production seeds StdRng from entropy; tests use fixed seeds or scripted sequences.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniform draws in [0, 1).
///
/// Every gate in the orchestrator, tagging selector, personality transform and
/// pacing simulator draws through this trait so tests can drive them
/// deterministically.
pub trait RandomSource: Send {
    /// Uniform value in [0, 1)
    fn next_f64(&mut self) -> f64;

    /// True with probability `p` (clamped to [0, 1])
    fn chance(&mut self, p: f64) -> bool {
        let p = p.clamp(0.0, 1.0);
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.next_f64() < p
    }

    /// Uniform value in [low, high)
    fn range_f64(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        low + (high - low) * self.next_f64()
    }

    /// Uniform integer in [low, high] inclusive
    fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        let span = (high - low + 1) as f64;
        let offset = (self.next_f64() * span).floor() as u64;
        low + offset.min(high - low)
    }

    /// Index in [0, len), or None for an empty range
    fn index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            None
        } else {
            Some(self.range_u64(0, len as u64 - 1) as usize)
        }
    }

    /// Pick one element uniformly
    fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T>
    where
        Self: Sized,
    {
        self.index(items.len()).map(|i| &items[i])
    }
}

/// StdRng-backed source; seedable for reproducible runs.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

/// Replays a fixed list of draws, cycling when exhausted.
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    values: Vec<f64>,
    position: usize,
}

impl SequenceRandom {
    pub fn new(values: impl Into<Vec<f64>>) -> Self {
        let values: Vec<f64> = values.into();
        Self {
            values: values
                .into_iter()
                .map(|v| v.clamp(0.0, 0.999_999_999))
                .collect(),
            position: 0,
        }
    }

    /// A source that always returns the same draw
    pub fn constant(value: f64) -> Self {
        Self::new(vec![value])
    }

    /// How many draws have been consumed so far
    pub fn draws(&self) -> usize {
        self.position
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let value = self.values[self.position % self.values.len()];
        self.position += 1;
        value
    }
}

impl<R: RandomSource + ?Sized> RandomSource for Box<R> {
    fn next_f64(&mut self) -> f64 {
        (**self).next_f64()
    }
}
