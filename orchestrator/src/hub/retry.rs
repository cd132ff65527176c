use std::time::Duration;

/// Outer retry policy for transient API failures: capped exponential backoff
/// with full jitter. One policy per gateway; operations are wrapped exactly
/// once, at the gateway surface. Composing helpers (`namespace_exists`,
/// `secret_exists`) call an already-wrapped operation and add no retry of
/// their own.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): a uniform random
    /// duration within (0, min(cap, base * 2^attempt)]. Randomizing over the
    /// whole span keeps a burst of throttled callers from retrying in
    /// lockstep.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let scaled_ms = match u32::try_from(attempt) {
            Ok(shift) if shift < 64 => base_ms.saturating_mul(1u64 << shift),
            _ => u64::MAX,
        };
        let span_ms = scaled_ms.min(cap_ms).max(1);
        Duration::from_millis(rand::random_range(1..=span_ms))
    }
}

/// Server-side 5xx and 429 are retryable; other API codes are not.
/// Transport-level failures (connection reset, read timeout) surface as
/// non-API errors and are retryable.
pub fn is_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
        _ => true,
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use kube::core::response::StatusSummary;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(Box::new(ErrorResponse {
            status: Some(StatusSummary::Failure),
            message: "test".into(),
            reason: "test".into(),
            code,
            details: None,
            metadata: None,
        }))
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(is_retryable(&api_error(500)));
        assert!(is_retryable(&api_error(503)));
        assert!(is_retryable(&api_error(429)));
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!is_retryable(&api_error(400)));
        assert!(!is_retryable(&api_error(403)));
        assert!(!is_retryable(&api_error(404)));
        assert!(!is_retryable(&api_error(409)));
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(410)));
    }

    #[test]
    fn backoff_stays_positive_and_capped() {
        let policy = RetryPolicy::default();
        for attempt in 0..100 {
            let delay = policy.backoff(attempt);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= policy.cap);
        }
    }

    #[test]
    fn first_backoff_is_bounded_by_the_base() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            assert!(policy.backoff(0) <= policy.base);
        }
    }
}
