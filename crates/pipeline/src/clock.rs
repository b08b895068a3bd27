//! Wall-clock source for job timestamps.

use cardsmith_core::types::Timestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall time derived from tokio's monotonic clock.
///
/// Captures one `Utc::now()` at construction and advances it by the
/// elapsed [`tokio::time::Instant`], so timestamps follow paused or
/// auto-advanced time in tests and agree with the tracker's deadlines.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_instant: tokio::time::Instant,
    origin_wall: Timestamp,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin_instant: tokio::time::Instant::now(),
            origin_wall: chrono::Utc::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        let elapsed = chrono::Duration::from_std(self.origin_instant.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_wall + elapsed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = TokioClock::new();
        let start = clock.now();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }
}
