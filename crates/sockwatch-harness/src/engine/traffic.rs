use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Decides, once per driver round, whether an extra request follows the main
/// one and after how long.
pub trait TrafficShape: Send {
    fn next_extra(&mut self) -> Option<Duration>;
}

/// Extra request with probability `probability`, delayed by a whole number
/// of seconds drawn uniformly from `[0, max_delay_secs)`.
pub struct RandomShape {
    probability: f64,
    max_delay_secs: u64,
    rng: StdRng,
}

impl RandomShape {
    pub fn new(probability: f64, max_delay_secs: u64) -> Self {
        Self::with_rng(probability, max_delay_secs, StdRng::from_entropy())
    }

    pub fn seeded(probability: f64, max_delay_secs: u64, seed: u64) -> Self {
        Self::with_rng(probability, max_delay_secs, StdRng::seed_from_u64(seed))
    }

    fn with_rng(probability: f64, max_delay_secs: u64, rng: StdRng) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        Self {
            probability,
            max_delay_secs,
            rng,
        }
    }
}

impl TrafficShape for RandomShape {
    fn next_extra(&mut self) -> Option<Duration> {
        if !self.rng.gen_bool(self.probability) {
            return None;
        }
        let secs = if self.max_delay_secs == 0 {
            0
        } else {
            self.rng.gen_range(0..self.max_delay_secs)
        };
        Some(Duration::from_secs(secs))
    }
}

/// Same answer every round.
pub struct FixedShape {
    extra: Option<Duration>,
}

impl FixedShape {
    pub fn never() -> Self {
        Self { extra: None }
    }

    pub fn always(delay: Duration) -> Self {
        Self { extra: Some(delay) }
    }
}

impl TrafficShape for FixedShape {
    fn next_extra(&mut self) -> Option<Duration> {
        self.extra
    }
}
