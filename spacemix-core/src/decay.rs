//! Half-life decay of interaction events.
//!
//! An event's contribution is scaled by
//!
//! ```text
//! decay(t) = 0.5 ^ ((reference - t) / half_life)
//! ```
//!
//! where `reference` is fixed when the engine is constructed. Because the
//! reference never moves, the factor depends only on the event's own
//! timestamp, which is what keeps event application order-independent.
//! Events stamped after the reference count at full strength.

use chrono::{DateTime, Duration, Utc};

/// Exponential half-life decay against a fixed reference time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayModel {
    reference: DateTime<Utc>,
    half_life: Duration,
}

impl DecayModel {
    /// Create a model. A non-positive half-life disables decay.
    #[must_use]
    pub fn new(reference: DateTime<Utc>, half_life: Duration) -> Self {
        Self {
            reference,
            half_life,
        }
    }

    /// Reference time.
    #[must_use]
    pub fn reference(&self) -> DateTime<Utc> {
        self.reference
    }

    /// Half-life.
    #[must_use]
    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    /// Decay factor in `(0, 1]` for an event at `t`.
    #[must_use]
    pub fn factor(&self, t: DateTime<Utc>) -> f64 {
        let half_life_ms = self.half_life.num_milliseconds() as f64;
        if half_life_ms <= 0.0 {
            return 1.0;
        }
        let elapsed_ms = (self.reference - t).num_milliseconds().max(0) as f64;
        half_life_decay(elapsed_ms / half_life_ms)
    }
}

/// `0.5^half_lives`.
#[must_use]
pub fn half_life_decay(half_lives: f64) -> f64 {
    if half_lives <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(half_lives)
}
