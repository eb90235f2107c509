//! Error taxonomy for the harness
//!
//! Transient failures are retried by the component that hit them. Timeouts,
//! contract violations and the joined errors of fan-out helpers bubble up to
//! the caller. Preconditions and environmental skips are surfaced so callers
//! can turn them into skipped checks instead of failures.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Network or stream hiccup talking to the API server, Prometheus or an exec session
    #[error("transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The cluster did not reach the expected state within the budget
    #[error("timed out after {elapsed:?} waiting for {operation}{}", last_seen_suffix(.last_observation))]
    Timeout {
        operation: String,
        elapsed: Duration,
        last_observation: Option<String>,
    },

    /// Required resources are absent; the check should be skipped
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// An invariant the harness relies on does not hold
    #[error("contract violation: {0}")]
    Contract(String),

    /// The environment cannot run this check (unsupported device, version, topology)
    #[error("skipped: {0}")]
    Skip(String),

    /// A shell command inside a pod failed
    #[error("command {command:?} failed in pod {pod}: {message}")]
    Exec {
        pod: String,
        command: String,
        message: String,
    },

    /// Invalid input supplied by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Wraps another error with the operation and target it happened on
    #[error("{operation} on {target}: {source}")]
    Context {
        operation: String,
        target: String,
        #[source]
        source: Box<HarnessError>,
    },

    /// Joined errors from parallel workers or accumulated restore failures
    #[error("{}", JoinedDisplay(.0))]
    Multiple(Vec<HarnessError>),
}

fn last_seen_suffix(last: &Option<String>) -> String {
    match last {
        Some(observation) => format!(" (last observation: {})", observation),
        None => String::new(),
    }
}

struct JoinedDisplay<'a>(&'a [HarnessError]);

impl fmt::Display for JoinedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for err in self.0 {
            write!(f, "\n  * {}", err)?;
        }
        Ok(())
    }
}

impl HarnessError {
    pub fn transient(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        HarnessError::Transient {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        HarnessError::Timeout {
            operation: operation.into(),
            elapsed,
            last_observation: None,
        }
    }

    /// Wrap this error with the operation and target it occurred on
    pub fn context(self, operation: impl Into<String>, target: impl Into<String>) -> Self {
        HarnessError::Context {
            operation: operation.into(),
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// True if the error means "skip this check" rather than "fail"
    pub fn is_skip(&self) -> bool {
        match self {
            HarnessError::Precondition(_) | HarnessError::Skip(_) => true,
            HarnessError::Context { source, .. } => source.is_skip(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            HarnessError::Timeout { .. } => true,
            HarnessError::Context { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True if the Kubernetes API reported the object as missing
    pub fn is_not_found(&self) -> bool {
        match self {
            HarnessError::Kube(kube::Error::Api(response)) => response.code == 404,
            HarnessError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Join errors from parallel workers. Returns `Ok(())` when there are none.
    pub fn join(errors: Vec<HarnessError>) -> Result<()> {
        let mut errors = errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(HarnessError::Multiple(errors)),
        }
    }
}

/// Extension for attaching operation/target context to results
pub trait ResultExt<T> {
    fn context(self, operation: &str, target: &str) -> Result<T>;
}

impl<T, E: Into<HarnessError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, operation: &str, target: &str) -> Result<T> {
        self.map_err(|e| e.into().context(operation, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_empty_is_ok() {
        assert!(HarnessError::join(vec![]).is_ok());
    }

    #[test]
    fn test_join_single_unwraps() {
        let err = HarnessError::join(vec![HarnessError::Contract("x".into())]).unwrap_err();
        assert!(matches!(err, HarnessError::Contract(_)));
    }

    #[test]
    fn test_join_multiple_lists_all() {
        let err = HarnessError::join(vec![
            HarnessError::Contract("first".into()),
            HarnessError::Skip("second".into()),
        ])
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("2 errors occurred"));
        assert!(message.contains("first"));
        assert!(message.contains("second"));
    }

    #[test]
    fn test_skip_detection_through_context() {
        let err = HarnessError::Precondition("no GM profile".into()).context("select node", "all");
        assert!(err.is_skip());
        assert!(!HarnessError::Contract("x".into()).is_skip());
    }

    #[test]
    fn test_timeout_display_includes_observation() {
        let err = HarnessError::Timeout {
            operation: "clock state".into(),
            elapsed: Duration::from_secs(5),
            last_observation: Some("value 0".into()),
        };
        assert!(err.to_string().contains("last observation: value 0"));
        assert!(err.is_timeout());
    }
}
