//! Remote shell transport.
//!
//! The [`Transport`] trait is the seam between script execution and the
//! network. [`WinRmTransport`] speaks WS-Management to a Windows host; tests
//! substitute [`crate::test_support::ScriptedTransport`].

mod http;
mod ntlm;
mod powershell;
mod soap;
mod winrm;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use uuid::Uuid;

use crate::error::HypervError;

pub use powershell::{MAX_INLINE_COMMAND, clean_stderr};
pub use winrm::WinRmTransport;

/// Boxed future returned by [`Transport`] implementations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HypervError>> + Send + 'a>>;

/// One request to run a rendered script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptInvocation {
    id: Uuid,
    script: String,
    body: String,
    deadline: Duration,
    expects_result: bool,
}

impl ScriptInvocation {
    /// Creates an invocation with a fresh identifier.
    pub fn new(
        script: impl Into<String>,
        body: impl Into<String>,
        deadline: Duration,
        expects_result: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            script: script.into(),
            body: body.into(),
            deadline,
            expects_result,
        }
    }

    /// Correlation identifier used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the template the body was rendered from.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Rendered PowerShell text.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Hard upper bound on the whole exchange.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Whether the caller will decode standard output.
    #[must_use]
    pub const fn expects_result(&self) -> bool {
        self.expects_result
    }
}

/// Exit status and captured streams of one invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code reported by the host, if any.
    pub exit_code: Option<i64>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error with PowerShell serialisation removed.
    pub stderr: String,
}

impl ExecutionResult {
    /// Successful result with the given output.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed result with the given exit code and error text.
    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true when the process exited with status zero and wrote
    /// nothing to its error stream.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && self.stderr.trim().is_empty()
    }
}

/// Executes rendered scripts on a remote host.
///
/// Implementations must be safe to share between concurrent callers and
/// must report network-level problems as [`HypervError::Transport`] so
/// callers can tell them apart from script failures.
pub trait Transport: Send + Sync {
    /// Host the transport talks to, used in diagnostics.
    fn host(&self) -> &str;

    /// Runs `invocation` to completion and returns its streams.
    fn execute<'a>(&'a self, invocation: &'a ScriptInvocation)
    -> TransportFuture<'a, ExecutionResult>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn host(&self) -> &str {
        (**self).host()
    }

    fn execute<'a>(
        &'a self,
        invocation: &'a ScriptInvocation,
    ) -> TransportFuture<'a, ExecutionResult> {
        (**self).execute(invocation)
    }
}
