use std::time::Duration;

/// Waits inserted after a claim so the backend's read side can catch up
/// before the lists are re-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    /// Wait after the first claim of a session; the backend is slower cold.
    pub first_claim: Duration,
    pub later_claim: Duration,
    /// Wait before the single re-fetch of an empty my-orders list.
    pub empty_retry: Duration,
}

impl SettlePolicy {
    pub fn immediate() -> Self {
        Self {
            first_claim: Duration::ZERO,
            later_claim: Duration::ZERO,
            empty_retry: Duration::ZERO,
        }
    }

    pub fn settle_delay(&self, first_claim: bool) -> Duration {
        if first_claim {
            self.first_claim
        } else {
            self.later_claim
        }
    }
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            first_claim: Duration::from_millis(1200),
            later_claim: Duration::from_millis(800),
            empty_retry: Duration::from_millis(1000),
        }
    }
}

/// Sleeps unless the delay is zero, so zero-delay policies never yield.
pub(crate) async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
