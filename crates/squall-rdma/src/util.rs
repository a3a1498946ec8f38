//! Small internal helpers.

use std::time::Duration;

use rand::Rng;

/// Retry scheduling with decorrelated jitter.
///
/// Each delay is drawn uniformly between the base delay and three times
/// the previous delay, so concurrent retriers spread out instead of
/// hammering a recovering resource in lockstep.
#[derive(Clone, Debug)]
pub(crate) struct RetryDelay {
    /// The last delay this schedule returned, in msec; 0 before the
    /// first draw.
    last_delay_ms: u32,
    /// The lowest delay this schedule may return, in msec.
    low_bound_ms: u32,
}

/// Lowest permitted lower bound, in milliseconds.
const MIN_LOW_BOUND: u32 = 1;

/// Maximum multiple of the previous delay.
const MAX_DELAY_MULT: u32 = 3;

impl RetryDelay {
    /// Construct a schedule whose smallest delay is `base`.
    pub(crate) fn from_duration(base: Duration) -> Self {
        let ms = u32::try_from(base.as_millis()).unwrap_or(u32::MAX - 1);
        RetryDelay {
            last_delay_ms: 0,
            low_bound_ms: ms.clamp(MIN_LOW_BOUND, u32::MAX - 1),
        }
    }

    /// Draw the next delay from this schedule.
    pub(crate) fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let low = self.low_bound_ms;
        let high = std::cmp::max(low + 1, self.last_delay_ms.saturating_mul(MAX_DELAY_MULT));
        let val = rng.random_range(low..high);
        self.last_delay_ms = val;
        Duration::from_millis(u64::from(val))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;

    #[test]
    fn delays_stay_within_bounds() {
        let mut rd = RetryDelay::from_duration(Duration::from_millis(10));
        let mut rng = rand::rng();
        let mut prev = Duration::ZERO;
        for _ in 0..50 {
            let d = rd.next_delay(&mut rng);
            assert!(d >= Duration::from_millis(10));
            assert!(d <= std::cmp::max(Duration::from_millis(11), prev * 3));
            prev = d;
        }
    }

    #[test]
    fn zero_base_is_clamped() {
        let mut rd = RetryDelay::from_duration(Duration::ZERO);
        let mut rng = rand::rng();
        assert!(rd.next_delay(&mut rng) >= Duration::from_millis(1));
    }
}
