//! # Fibonacci Backoff
//!
//! Progressive retry delays for failing machines. The sequence grows more
//! slowly than exponential backoff: with a 10s minimum and a 600s cap it
//! runs 10s, 10s, 20s, 30s, 50s, 80s, 130s, 210s, 340s, 550s, 600s.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_seconds` and capped at `max_seconds`
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        Duration::from_secs(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(backoff: &mut FibonacciBackoff, n: usize) -> Vec<u64> {
        (0..n).map(|_| backoff.next_backoff().as_secs()).collect()
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(10, 600);
        assert_eq!(
            take(&mut backoff, 12),
            vec![10, 10, 20, 30, 50, 80, 130, 210, 340, 550, 600, 600]
        );
    }

    #[test]
    fn test_fibonacci_backoff_permanent_sequence() {
        let mut backoff = FibonacciBackoff::new(60, 600);
        assert_eq!(take(&mut backoff, 8), vec![60, 60, 120, 180, 300, 480, 600, 600]);
    }
}
