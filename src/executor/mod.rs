//! Script execution pipeline: render, run under a deadline, classify, decode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::context::OperationContext;
use crate::decode::decode;
use crate::error::HypervError;
use crate::template::{ScriptCatalog, ScriptTemplate};
use crate::transport::{ExecutionResult, ScriptInvocation, Transport};

/// Runs catalogued scripts through a [`Transport`].
///
/// The executor holds no per-call state and can be shared freely between
/// concurrent tasks.
#[derive(Debug)]
pub struct ScriptExecutor<T> {
    transport: T,
    catalog: Arc<ScriptCatalog>,
    default_timeout: Duration,
}

impl<T: Transport> ScriptExecutor<T> {
    /// Creates an executor; `default_timeout` applies when the operation
    /// context carries no override.
    #[must_use]
    pub const fn new(transport: T, catalog: Arc<ScriptCatalog>, default_timeout: Duration) -> Self {
        Self {
            transport,
            catalog,
            default_timeout,
        }
    }

    /// Underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Deadline applied when the operation context carries none.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Renders and runs `template`, decoding standard output into `R`.
    ///
    /// Empty output or `{}` decodes to `R::default()`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] for render failures,
    /// [`HypervError::Transport`], [`HypervError::Timeout`], or
    /// [`HypervError::Cancelled`] for execution failures,
    /// [`HypervError::RemoteScript`] when the script reports an error, and
    /// [`HypervError::Decode`] for unparseable output.
    pub async fn run_with_result<A, R>(
        &self,
        ctx: &OperationContext,
        template: &ScriptTemplate,
        args: &A,
    ) -> Result<R, HypervError>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Default,
    {
        let result = self.execute(ctx, template, args, true).await?;
        decode(template.name(), &result.stdout)
    }

    /// Renders and runs `template`, judging success by exit status alone.
    ///
    /// # Errors
    ///
    /// As [`Self::run_with_result`], minus decoding.
    pub async fn run<A>(
        &self,
        ctx: &OperationContext,
        template: &ScriptTemplate,
        args: &A,
    ) -> Result<(), HypervError>
    where
        A: Serialize + Sync + ?Sized,
    {
        self.execute(ctx, template, args, false).await.map(drop)
    }

    async fn execute<A>(
        &self,
        ctx: &OperationContext,
        template: &ScriptTemplate,
        args: &A,
        expects_result: bool,
    ) -> Result<ExecutionResult, HypervError>
    where
        A: Serialize + Sync + ?Sized,
    {
        let body = self.catalog.render(template, args)?;
        let invocation = ScriptInvocation::new(
            template.name(),
            body,
            ctx.deadline_or(self.default_timeout),
            expects_result,
        );
        debug!(
            host = self.transport.host(),
            script = template.name(),
            invocation_id = %invocation.id(),
            deadline = ?invocation.deadline(),
            "submitting script"
        );

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => Err(HypervError::Cancelled {
                script: template.name().to_owned(),
            }),
            finished = tokio::time::timeout(invocation.deadline(), self.transport.execute(&invocation)) => {
                finished.unwrap_or_else(|_| Err(HypervError::Timeout {
                    script: template.name().to_owned(),
                    after: invocation.deadline(),
                }))
            }
        };

        let result = outcome.inspect_err(|err| {
            warn!(
                host = self.transport.host(),
                script = template.name(),
                invocation_id = %invocation.id(),
                elapsed = ?started.elapsed(),
                error = %err,
                "script did not complete"
            );
        })?;
        classify(template.name(), result)
    }
}

/// Turns a finished execution into success or [`HypervError::RemoteScript`].
///
/// Any non-zero or missing exit code fails, as does a zero exit with text
/// on the error stream.
///
/// # Errors
///
/// Returns [`HypervError::RemoteScript`] carrying both streams verbatim.
pub fn classify(script: &str, result: ExecutionResult) -> Result<ExecutionResult, HypervError> {
    if result.is_success() {
        return Ok(result);
    }
    warn!(
        script,
        exit_code = ?result.exit_code,
        stderr = %result.stderr,
        "remote script reported failure"
    );
    Err(HypervError::remote_script(
        script,
        result.exit_code,
        result.stdout,
        result.stderr,
    ))
}
