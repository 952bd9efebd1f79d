//! How long the scheduler sleeps between ticks that found nothing due.
//!
//! - `Fixed`: the same pause every time
//! - `Adaptive`: back off while idle, snap back to the minimum on work

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Idle sleep policy for the scheduler loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PollingStrategy {
    /// Constant pause.
    Fixed {
        /// Pause in milliseconds.
        interval_ms: u64,
    },

    /// Exponential backoff between a floor and a ceiling.
    Adaptive {
        /// Pause right after a tick that ran strands.
        min_interval_ms: u64,
        /// Upper bound while idle.
        max_interval_ms: u64,
        /// Growth factor per idle tick.
        backoff_multiplier: f64,
    },
}

impl Default for PollingStrategy {
    fn default() -> Self {
        Self::Adaptive {
            min_interval_ms: 50,
            max_interval_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl PollingStrategy {
    /// Fixed pause of `interval_ms`.
    #[must_use]
    pub const fn fixed(interval_ms: u64) -> Self {
        Self::Fixed { interval_ms }
    }

    /// Adaptive backoff doubling from `min_interval_ms` to `max_interval_ms`.
    #[must_use]
    pub const fn adaptive(min_interval_ms: u64, max_interval_ms: u64) -> Self {
        Self::Adaptive {
            min_interval_ms,
            max_interval_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Pause before the first idle sleep.
    #[must_use]
    pub const fn initial_interval(&self) -> Duration {
        match self {
            Self::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Self::Adaptive {
                min_interval_ms, ..
            } => Duration::from_millis(*min_interval_ms),
        }
    }

    /// Next pause given the current one and whether the last tick found work.
    #[must_use]
    pub fn next_interval(&self, current: Duration, found_work: bool) -> Duration {
        match self {
            Self::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Self::Adaptive {
                min_interval_ms,
                max_interval_ms,
                backoff_multiplier,
            } => {
                if found_work {
                    return Duration::from_millis(*min_interval_ms);
                }
                let floor = current.max(Duration::from_millis(*min_interval_ms));
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let next_ms = (floor.as_millis() as f64 * backoff_multiplier) as u64;
                Duration::from_millis(next_ms.clamp(*min_interval_ms, *max_interval_ms))
            }
        }
    }

    /// Spreads `interval` by +/-10% so idle workers do not poll in lockstep.
    #[must_use]
    pub fn apply_jitter(&self, interval: Duration) -> Duration {
        let factor = rand::random::<f64>().mul_add(0.2, 0.9);
        Duration::from_secs_f64(interval.as_secs_f64() * factor)
    }

    /// Rejects intervals that would spin or never wake.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Fixed { interval_ms } if *interval_ms == 0 => {
                Err("polling.interval_ms must be greater than 0".to_string())
            }
            Self::Fixed { .. } => Ok(()),
            Self::Adaptive {
                min_interval_ms,
                max_interval_ms,
                backoff_multiplier,
            } => {
                if *min_interval_ms == 0 {
                    Err("polling.min_interval_ms must be greater than 0".to_string())
                } else if max_interval_ms < min_interval_ms {
                    Err(format!(
                        "polling.max_interval_ms ({max_interval_ms}) must be >= min_interval_ms ({min_interval_ms})"
                    ))
                } else if *backoff_multiplier < 1.0 {
                    Err(format!(
                        "polling.backoff_multiplier ({backoff_multiplier}) must be >= 1.0"
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}
