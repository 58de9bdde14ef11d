use std::time::Duration;
use usync_common::UsyncError;

/// Single backoff/retry driver for NNTP operations, grounded on the
/// error-class matrix in §4.5/§7: `ProviderTransient` and a deadlocked
/// Catalog transaction are retried; everything else is surfaced
/// immediately. Exponential backoff starting at 500ms, factor 2, capped
/// at 60s, with +/-20% jitter so a fleet of workers doesn't retry in
/// lockstep against the same server.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the `attempt`-th retry (0-based: the delay before
    /// the first retry after an initial failed attempt).
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        let jitter_range = capped * self.jitter;
        // jitter_sample in [-1.0, 1.0] maps to +/- jitter_range.
        let jittered = (capped + jitter_sample * jitter_range).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Whether an error should be retried at all, independent of attempt
/// count — the error-class half of the §4.5/§7 matrix.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<UsyncError>()
        .map(UsyncError::is_retryable)
        .unwrap_or(false)
}
