//! Error taxonomy shared by every layer of the execution engine.
//!
//! All runtime failures surface as [`HypervError`]. Callers that only care
//! about the broad classification (for example to decide whether a retry is
//! sensible) use [`HypervError::kind`].

use std::time::Duration;

use thiserror::Error;

/// Broad classification of a runtime failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Invalid or contradictory arguments detected before any remote call.
    Validation,
    /// Network, authentication, or protocol failure reaching the host.
    TransportFailure,
    /// The deadline elapsed (or the caller cancelled) before completion.
    Timeout,
    /// The script ran and reported an application-level error.
    RemoteScriptFailure,
    /// The script succeeded but its payload could not be decoded.
    DecodeFailure,
}

/// Errors raised while rendering, executing, or decoding a remote script.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HypervError {
    /// Arguments were rejected before reaching the remote host.
    #[error("invalid {field}: {message}")]
    Validation {
        /// Name of the offending argument or template.
        field: String,
        /// Human-readable reason.
        message: String,
    },
    /// The WinRM exchange failed below the script level.
    #[error("[{host}] transport failure: {message}")]
    Transport {
        /// Host the session targets.
        host: String,
        /// Description of the failure with credentials removed.
        message: String,
    },
    /// The invocation deadline elapsed; the remote process was abandoned.
    #[error("script {script} did not finish within {after:?}; remote state is unknown")]
    Timeout {
        /// Name of the script template.
        script: String,
        /// Deadline that was exceeded.
        after: Duration,
    },
    /// The caller cancelled the operation while the script was running.
    #[error("script {script} was cancelled; remote state is unknown")]
    Cancelled {
        /// Name of the script template.
        script: String,
    },
    /// The script exited unsuccessfully or wrote to its error stream.
    #[error("script {script} failed with {status_text}: {stderr}")]
    RemoteScript {
        /// Name of the script template.
        script: String,
        /// Process exit code, when the host reported one.
        exit_code: Option<i64>,
        /// Printable form of the exit status.
        status_text: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error, verbatim.
        stderr: String,
    },
    /// The script succeeded but emitted an unparseable payload.
    #[error("failed to decode output of {script}: {message}; payload: {payload}")]
    Decode {
        /// Name of the script template.
        script: String,
        /// Parser diagnostic.
        message: String,
        /// Raw standard output that failed to parse.
        payload: String,
    },
}

impl HypervError {
    /// Builds a [`HypervError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Builds a [`HypervError::Transport`].
    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Builds a [`HypervError::RemoteScript`] from a finished execution.
    #[must_use]
    pub fn remote_script(
        script: &str,
        exit_code: Option<i64>,
        stdout: String,
        stderr: String,
    ) -> Self {
        let status_text = exit_code.map_or_else(
            || String::from("unknown exit status"),
            |code| format!("exit code {code}"),
        );
        Self::RemoteScript {
            script: script.to_owned(),
            exit_code,
            status_text,
            stdout,
            stderr,
        }
    }

    /// Classifies the error into the five-kind taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Transport { .. } => ErrorKind::TransportFailure,
            Self::Timeout { .. } | Self::Cancelled { .. } => ErrorKind::Timeout,
            Self::RemoteScript { .. } => ErrorKind::RemoteScriptFailure,
            Self::Decode { .. } => ErrorKind::DecodeFailure,
        }
    }

    /// Whether a caller may reasonably retry the operation as-is.
    ///
    /// Only transport failures qualify; script and decode failures repeat
    /// deterministically and timeouts need a state re-read first.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransportFailure)
    }
}
