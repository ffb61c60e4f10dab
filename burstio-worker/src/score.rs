//! Worker score
//!
//! A weighted sum of five availability terms, each in `[0, 1]`, bucketed
//! into an integer score of at least 100. Schedulers prefer higher scores.

/// Weights of queue load, free capacity, liveness, energy and speed
pub const POLICY_WEIGHTS: [f64; 5] = [0.3, 0.2, 0.3, 0.1, 0.1];

/// Highest energy or speed rating
pub const MAX_RATING: u32 = 5;

/// Inputs to the score of one worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub queue_len: usize,
    pub max_queue_depth: usize,
    pub remaining_capacity: u64,
    pub total_capacity: u64,
    pub alive: bool,
    pub energy: u32,
    pub speed: u32,
}

impl ScoreInputs {
    /// Fraction of the queue still free
    pub fn queue_load(&self) -> f64 {
        if self.max_queue_depth == 0 {
            return 0.0;
        }
        let used = self.queue_len.min(self.max_queue_depth) as f64;
        1.0 - used / self.max_queue_depth as f64
    }

    pub fn capacity_fraction(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        self.remaining_capacity.min(self.total_capacity) as f64 / self.total_capacity as f64
    }

    /// Weighted sum of the five terms
    pub fn raw_score(&self) -> f64 {
        let terms = [
            self.queue_load(),
            self.capacity_fraction(),
            if self.alive { 1.0 } else { 0.0 },
            rating(self.energy),
            rating(self.speed),
        ];
        POLICY_WEIGHTS.iter().zip(terms).map(|(w, t)| w * t).sum()
    }

    /// Score to publish, `None` when nothing should be published
    pub fn score(&self) -> Option<u32> {
        bucket_score(self.raw_score())
    }
}

fn rating(value: u32) -> f64 {
    value.min(MAX_RATING) as f64 / MAX_RATING as f64
}

/// Map a raw score in `[0, 1]` onto the published integer score.
///
/// Each fifth of the range has its own slope, steepest for the least
/// available workers.
pub fn bucket_score(raw: f64) -> Option<u32> {
    let slope = match raw {
        s if (0.0..0.2).contains(&s) => 5.0,
        s if (0.2..0.4).contains(&s) => 4.0,
        s if (0.4..0.6).contains(&s) => 3.0,
        s if (0.6..0.8).contains(&s) => 2.0,
        s if (0.8..=1.0).contains(&s) => 1.0,
        _ => return None,
    };
    Some((slope * raw * 100.0 + 100.0).round() as u32)
}
