use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("timed out after {timeout:?} waiting for {description}")]
    TimedOut {
        description: String,
        timeout: Duration,
    },

    #[error("cancelled while waiting for {description}")]
    Cancelled { description: String },

    #[error(transparent)]
    Predicate(E),
}

/// A single poll-until-true wait with an explicit total timeout and interval.
///
/// The predicate is evaluated immediately, then once per interval until the
/// next evaluation would land past the deadline. `allow_post_timeout_success`
/// grants exactly one extra evaluation after the deadline.
#[derive(Clone, Debug)]
pub struct Wait {
    pub description: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub allow_post_timeout_success: bool,
}

impl Wait {
    pub fn new(description: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
        Self {
            description: description.into(),
            timeout,
            interval,
            allow_post_timeout_success: false,
        }
    }

    pub fn allow_post_timeout_success(mut self) -> Self {
        self.allow_post_timeout_success = true;
        self
    }

    /// Drive the predicate until it returns true, the deadline passes, or the
    /// token is cancelled. Predicate errors propagate immediately; they are
    /// never folded into "not yet".
    pub async fn run<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut predicate: F,
    ) -> Result<(), WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if predicate().await.map_err(WaitError::Predicate)? {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled {
                    description: self.description.clone(),
                });
            }
            // Never sleep past the deadline; the final pre-deadline check
            // still happens even when the interval does not divide evenly.
            let sleep_for = self.interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled {
                        description: self.description.clone(),
                    });
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        if self.allow_post_timeout_success && predicate().await.map_err(WaitError::Predicate)? {
            return Ok(());
        }
        Err(WaitError::TimedOut {
            description: self.description.clone(),
            timeout: self.timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait(timeout_ms: u64, interval_ms: u64) -> Wait {
        Wait::new(
            "test condition",
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_evaluation_without_sleeping() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        wait(1000, 100)
            .run::<_, _, std::convert::Infallible>(&cancel, move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            })
            .await
            .expect("immediate success");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_true_before_deadline() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        wait(1000, 100)
            .run::<_, _, std::convert::Infallible>(&cancel, move || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 3) }
            })
            .await
            .expect("eventual success");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn true_at_deadline_fails_without_grace() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let err = wait(250, 100)
            .run::<_, _, std::convert::Infallible>(&cancel, move || {
                let done = start.elapsed() >= Duration::from_millis(250);
                async move { Ok(done) }
            })
            .await
            .expect_err("should time out");
        assert!(matches!(err, WaitError::TimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn true_at_deadline_succeeds_with_grace() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        wait(250, 100)
            .allow_post_timeout_success()
            .run::<_, _, std::convert::Infallible>(&cancel, move || {
                let done = start.elapsed() >= Duration::from_millis(250);
                async move { Ok(done) }
            })
            .await
            .expect("post-timeout grace evaluation");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_sleep() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait(10_000, 100)
            .run::<_, _, std::convert::Infallible>(&cancel, || async { Ok(false) })
            .await
            .expect_err("cancelled");
        assert!(matches!(err, WaitError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_errors_propagate() {
        let cancel = CancellationToken::new();
        let err = wait(1000, 100)
            .run(&cancel, || async { Err::<bool, &str>("boom") })
            .await
            .expect_err("predicate error");
        assert!(matches!(err, WaitError::Predicate("boom")));
    }

}
