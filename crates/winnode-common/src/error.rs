//! Error types for winnode
//!
//! Errors are structured with fields to aid debugging in production.
//! Transport variants carry the host address, execution variants carry the
//! command and its combined output, convergence variants carry the host.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for winnode operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The remote host rejected our credentials. Waiting will not fix this.
    #[error("authentication to {address} failed: {message}")]
    Authentication {
        /// Address of the host that rejected us
        address: String,
        /// Description from the transport layer
        message: String,
    },

    /// Transient connectivity failure (refused, reset, timed out, host booting)
    #[error("connectivity error for {address}: {message}")]
    Connectivity {
        /// Address of the unreachable host
        address: String,
        /// Description of the failure
        message: String,
    },

    /// Connection attempts kept failing until the retry bound elapsed
    #[error("unable to connect to {address} within {timeout:?}: {last_error}")]
    ConnectTimeout {
        /// Address of the unreachable host
        address: String,
        /// Total time spent retrying
        timeout: Duration,
        /// The last transient failure observed
        last_error: String,
    },

    /// A remote command failed or a file transfer broke mid-copy
    #[error("remote execution on {address} failed [{command}]: {message}")]
    RemoteExecution {
        /// Address of the host
        address: String,
        /// Command or transfer target that failed
        command: String,
        /// Combined stdout and stderr, kept for diagnostics
        output: String,
        /// Description of what failed
        message: String,
    },

    /// The session dropped before the command reported an exit status, as
    /// when the command restarts the host
    #[error("channel to {address} closed before [{command}] reported an exit status")]
    ChannelClosed {
        /// Address of the host
        address: String,
        /// Command that was running
        command: String,
        /// Output received before the channel closed
        output: String,
    },

    /// Malformed or empty input supplied by the caller
    #[error("input error: {message}")]
    Input {
        /// Description of what's invalid
        message: String,
        /// The offending field or key, if known
        field: Option<String>,
    },

    /// A host did not converge on the trust bundle within the bound
    #[error("trust bundle did not converge on {host} within {timeout:?}: {message}")]
    ConvergenceTimeout {
        /// Host address
        host: String,
        /// Bound that elapsed
        timeout: Duration,
        /// Last observation before giving up
        message: String,
    },

    /// The caller cancelled the operation between poll iterations
    #[error("operation cancelled [{context}]")]
    Cancelled {
        /// What was running when cancellation was observed
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create an authentication error for a host
    pub fn authentication(address: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Authentication {
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create a transient connectivity error for a host
    pub fn connectivity(address: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connectivity {
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create a connect timeout error
    pub fn connect_timeout(
        address: impl Into<String>,
        timeout: Duration,
        last_error: impl Into<String>,
    ) -> Self {
        Self::ConnectTimeout {
            address: address.into(),
            timeout,
            last_error: last_error.into(),
        }
    }

    /// Create a remote execution error, keeping the command output
    pub fn remote_execution(
        address: impl Into<String>,
        command: impl Into<String>,
        output: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::RemoteExecution {
            address: address.into(),
            command: command.into(),
            output: output.into(),
            message: msg.into(),
        }
    }

    /// Create an error for a channel that closed without an exit status
    pub fn channel_closed(
        address: impl Into<String>,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::ChannelClosed {
            address: address.into(),
            command: command.into(),
            output: output.into(),
        }
    }

    /// Create an input error with the given message
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input {
            message: msg.into(),
            field: None,
        }
    }

    /// Create an input error naming the offending field
    pub fn input_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Input {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a convergence timeout error for a host
    pub fn convergence_timeout(
        host: impl Into<String>,
        timeout: Duration,
        msg: impl Into<String>,
    ) -> Self {
        Self::ConvergenceTimeout {
            host: host.into(),
            timeout,
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is worth retrying on a later reconciliation pass
    ///
    /// Authentication, input and serialization errors require a fix from the
    /// operator. Cancellation is deliberate. Everything else may clear up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Authentication { .. } => false,
            Error::Connectivity { .. } => true,
            Error::ConnectTimeout { .. } => true,
            Error::RemoteExecution { .. } => true,
            Error::ChannelClosed { .. } => true,
            Error::Input { .. } => false,
            Error::ConvergenceTimeout { .. } => true,
            Error::Cancelled { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for errors that a bounded connect loop must not wait out
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }

    /// Get the host address if this error is associated with a specific host
    pub fn address(&self) -> Option<&str> {
        match self {
            Error::Authentication { address, .. }
            | Error::Connectivity { address, .. }
            | Error::ConnectTimeout { address, .. }
            | Error::RemoteExecution { address, .. }
            | Error::ChannelClosed { address, .. } => Some(address),
            Error::ConvergenceTimeout { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Short machine-readable kind, used for metric labels and events
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Authentication { .. } => "authentication",
            Error::Connectivity { .. } => "connectivity",
            Error::ConnectTimeout { .. } => "connect_timeout",
            Error::RemoteExecution { .. } => "remote_execution",
            Error::ChannelClosed { .. } => "channel_closed",
            Error::Input { .. } => "input",
            Error::ConvergenceTimeout { .. } => "convergence_timeout",
            Error::Cancelled { .. } => "cancelled",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a rejected key is terminal, a refused socket is not
    ///
    /// The reconciliation caller re-attempts retryable failures on its next
    /// pass. Credential rejection must surface to the operator instead.
    #[test]
    fn story_transport_errors_are_classified() {
        let err = Error::authentication("10.0.0.4", "publickey rejected");
        assert!(err.is_authentication());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("10.0.0.4"));

        let err = Error::connectivity("10.0.0.4", "connection refused");
        assert!(!err.is_authentication());
        assert!(err.is_retryable());

        let err = Error::connect_timeout("10.0.0.4", Duration::from_secs(600), "reset");
        assert!(err.is_retryable());
        assert_eq!(err.address(), Some("10.0.0.4"));
        assert!(err.to_string().contains("reset"));
    }

    /// Story: a failed remote command keeps its output for diagnostics
    #[test]
    fn story_remote_execution_keeps_output() {
        let err = Error::remote_execution(
            "win-1.example.com",
            "Get-Content -Raw -Path C:\\k\\kubelet-ca.crt",
            "Get-Content : Cannot find path",
            "exit status 1",
        );
        match &err {
            Error::RemoteExecution { output, .. } => {
                assert!(output.contains("Cannot find path"));
            }
            _ => panic!("Expected RemoteExecution variant"),
        }
        assert_eq!(err.kind(), "remote_execution");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_input_errors_are_not_retryable() {
        let err = Error::input("annotations to format cannot be empty");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("cannot be empty"));

        let err = Error::input_for_field("10.1.1.1", "missing username");
        match &err {
            Error::Input { field, .. } => assert_eq!(field.as_deref(), Some("10.1.1.1")),
            _ => panic!("Expected Input variant"),
        }
    }

    #[test]
    fn test_channel_closed_is_retryable_and_names_host() {
        let err = Error::channel_closed("10.0.0.5", "Restart-Computer -Force", "");
        assert!(err.is_retryable());
        assert_eq!(err.address(), Some("10.0.0.5"));
        assert_eq!(err.kind(), "channel_closed");
        assert!(err.to_string().contains("Restart-Computer"));
    }

    #[test]
    fn test_convergence_timeout_names_host() {
        let err = Error::convergence_timeout("10.0.0.9", Duration::from_secs(60), "bundle absent");
        assert_eq!(err.address(), Some("10.0.0.9"));
        assert_eq!(err.kind(), "convergence_timeout");
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let err = Error::cancelled("connect 10.0.0.1");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("connect 10.0.0.1"));
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("reconciler", "unexpected state");
        assert!(err.to_string().contains("[reconciler]"));
    }
}
