use switchover_common::wait::WaitError;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed error set of the orchestrator. Phase modules match on variant,
/// never on message text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input failed syntactic or semantic validation. Never mutates state.
    #[error("invalid input: {0}")]
    Validation(String),

    /// An input was refused because it could enable path traversal or shell
    /// injection in downstream tooling.
    #[error("unsafe input rejected: {0}")]
    Security(String),

    /// A retryable API failure that survived every retry attempt.
    #[error("transient failure after {attempts} attempts: {source}")]
    Transient {
        attempts: usize,
        #[source]
        source: kube::Error,
    },

    /// Non-retryable failures: API errors, precondition violations,
    /// exhausted timeouts, invariant breaches.
    #[error("{message}")]
    Fatal {
        message: String,
        #[source]
        source: Option<kube::Error>,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Fatal {
            message: message.into(),
            source: None,
        }
    }

    /// A non-retryable API error with the full response attached.
    pub fn api(message: impl Into<String>, source: kube::Error) -> Self {
        Error::Fatal {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Process exit code for the CLI surface: 130 for operator interruption,
    /// 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Cancelled(_) => 130,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::fatal(format!("JSON error: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::fatal(format!("I/O error: {e}"))
    }
}

impl From<WaitError<Error>> for Error {
    fn from(e: WaitError<Error>) -> Self {
        match e {
            WaitError::TimedOut {
                description,
                timeout,
            } => Error::fatal(format!("timed out after {timeout:?} waiting for {description}")),
            WaitError::Cancelled { description } => Error::Cancelled(description),
            WaitError::Predicate(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_maps_to_interrupt_exit_code() {
        assert_eq!(Error::Cancelled("phase".into()).exit_code(), 130);
        assert_eq!(Error::fatal("boom").exit_code(), 1);
        assert_eq!(Error::Validation("bad".into()).exit_code(), 1);
    }

    #[test]
    fn wait_timeout_becomes_fatal() {
        let err: Error = WaitError::<Error>::TimedOut {
            description: "restore completion".into(),
            timeout: std::time::Duration::from_secs(5),
        }
        .into();
        assert!(matches!(err, Error::Fatal { .. }));
    }
}
