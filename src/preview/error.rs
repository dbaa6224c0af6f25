use thiserror::Error;

/// Failures the controller distinguishes by kind.
///
/// Components return `anyhow::Result` and wrap these where the kind matters to
/// a caller (tests and the sweep report downcast to inspect them).
#[derive(Debug, Error)]
pub enum PreviewError {
    /// A bounded wait ran out of attempts. `last_observed` is the final
    /// diagnostic snapshot taken before giving up.
    #[error("{operation} did not complete after {attempts} attempts; last observed: {last_observed}")]
    Timeout {
        operation: String,
        attempts: u32,
        last_observed: String,
    },

    /// Invalid job input or settings, raised before any cluster mutation.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external command exited unsuccessfully.
    #[error("command `{program}` failed with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    /// One or more deletions in a sweep failed. Siblings still ran.
    #[error("sweep finished with {} failed deletion(s): {}", failed.len(), failed.join(", "))]
    Sweep { failed: Vec<String> },
}

impl PreviewError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Check whether an error chain bottoms out in a Kubernetes 404
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_carries_snapshot() {
        let err = PreviewError::Timeout {
            operation: "pod readiness".to_string(),
            attempts: 3,
            last_observed: "proxy-0:Pending".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("pod readiness"));
        assert!(message.contains("3 attempts"));
        assert!(message.contains("proxy-0:Pending"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_sweep_message_lists_failures() {
        let err = PreviewError::Sweep {
            failed: vec!["staging-a".to_string(), "preview-b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "sweep finished with 2 failed deletion(s): staging-a, preview-b"
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PreviewError::config("branch is empty").into();
        let err = err.context("preparing environment");
        let inner = err.downcast_ref::<PreviewError>();
        assert!(matches!(inner, Some(PreviewError::Config(_))));
    }
}
