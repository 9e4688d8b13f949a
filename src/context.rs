//! Per-operation deadline and cancellation signal.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Context supplied by the reconciliation layer for one resource operation.
///
/// The timeout overrides the session's default operation timeout; the
/// cancellation token aborts any in-flight script when triggered.
#[derive(Clone, Debug)]
pub struct OperationContext {
    timeout: Option<Duration>,
    cancellation: CancellationToken,
}

impl OperationContext {
    /// Creates a context with no timeout override and a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Overrides the session default timeout for this operation.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Ties the operation to an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Timeout override, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolves the deadline for one invocation.
    #[must_use]
    pub fn deadline_or(&self, fallback: Duration) -> Duration {
        self.timeout.unwrap_or(fallback)
    }

    /// Token observed by the executor.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}
