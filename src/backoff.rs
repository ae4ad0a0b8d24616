//! Retry delay policy, injectable so retry logic tests without real timing.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackoffKind {
    /// Same delay between every attempt
    Fixed,
    /// Delay doubles per attempt, capped at the configured maximum
    Exponential,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub const fn fixed(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base,
            cap: base,
        }
    }

    #[must_use]
    pub const fn exponential(base: Duration, cap: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base,
            cap,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base,
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor).min(self.cap)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(16))
    }
}

/// Sleep seam. Production uses the tokio timer; tests record requested
/// delays instead of actually waiting.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn exponential_delay_doubles_then_caps() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn exponential_survives_large_attempt_numbers() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(63), Duration::from_secs(30));
    }

    #[test]
    fn recording_clock_captures_sleeps() {
        let clock = testing::RecordingClock::default();
        tokio_test::block_on(async {
            clock.sleep(Duration::from_secs(2)).await;
            clock.sleep(Duration::from_secs(4)).await;
        });
        assert_eq!(
            clock.slept(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }
}
