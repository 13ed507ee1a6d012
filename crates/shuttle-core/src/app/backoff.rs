//! Idle poll backoff for the worker loop.

use std::time::Duration;

/// Sleep between empty claims.
///
/// The delay grows geometrically from `min` by `factor` per consecutive empty
/// claim and is capped at `max`:
///
/// - empty claim 1: `min`
/// - empty claim 2: `min * factor`
/// - empty claim n: `min(min * factor^(n-1), max)`
///
/// A successful claim resets the count.
#[derive(Debug, Clone, PartialEq)]
pub struct PollBackoff {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl PollBackoff {
    /// Delay after `empty_polls` consecutive empty claims (1-indexed).
    pub fn next_delay(&self, empty_polls: u32) -> Duration {
        let exponent = empty_polls.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.min.as_nanos() as f64 * self.factor.max(1.0).powi(exponent);
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 100)]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(6, 3_200)]
    #[case(7, 5_000)]
    #[case(1_000, 5_000)]
    fn delay_grows_until_capped(#[case] empty_polls: u32, #[case] expected_ms: u64) {
        let backoff = PollBackoff::default();
        assert_eq!(
            backoff.next_delay(empty_polls),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn factor_below_one_never_shrinks_the_delay() {
        let backoff = PollBackoff {
            factor: 0.5,
            ..PollBackoff::default()
        };
        assert_eq!(backoff.next_delay(4), backoff.min);
    }
}
