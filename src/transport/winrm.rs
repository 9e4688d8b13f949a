//! WS-Management transport running PowerShell through a remote `cmd` shell.

use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, info, warn};

use super::http::{self, HttpChannel, Resend, SoapReply};
use super::powershell::{self, MAX_INLINE_COMMAND, StagedScript};
use super::soap;
use super::{ExecutionResult, ScriptInvocation, Transport, TransportFuture};
use crate::error::HypervError;
use crate::session::Session;

/// Upper bound for a single WS-Management long poll.
const MAX_POLL: Duration = Duration::from_secs(60);

/// Timeout for best-effort cleanup requests.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] backed by the Windows Remote Management service.
///
/// The HTTP client is created once and shared by all invocations; each
/// invocation opens its own remote shell, so concurrent callers never share
/// output streams or staging files.
#[derive(Debug, Clone)]
pub struct WinRmTransport {
    session: Session,
    client: Client,
}

impl WinRmTransport {
    /// Builds the transport for `session`. No connection is made until the
    /// first invocation.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Transport`] when the TLS configuration is
    /// unusable.
    pub fn new(session: Session) -> Result<Self, HypervError> {
        let client = http::build_client(&session)?;
        Ok(Self { session, client })
    }

    /// Session parameters.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    async fn run(&self, invocation: &ScriptInvocation) -> Result<ExecutionResult, HypervError> {
        let mut channel = HttpChannel::open(&self.session, &self.client)?;
        let poll = invocation.deadline().min(MAX_POLL);
        let shell = Shell::open(&mut channel, poll).await?;
        let outcome = shell.run_script(&mut channel, invocation, &self.session, poll).await;
        shell.close(&mut channel).await;
        outcome
    }
}

impl Transport for WinRmTransport {
    fn host(&self) -> &str {
        self.session.host()
    }

    fn execute<'a>(
        &'a self,
        invocation: &'a ScriptInvocation,
    ) -> TransportFuture<'a, ExecutionResult> {
        Box::pin(async move {
            let started = Instant::now();
            let deadline = invocation.deadline();
            let result = tokio::time::timeout(deadline, self.run(invocation))
                .await
                .map_err(|_| HypervError::Timeout {
                    script: invocation.script().to_owned(),
                    after: deadline,
                })??;
            info!(
                host = self.session.host(),
                script = invocation.script(),
                invocation_id = %invocation.id(),
                exit_code = ?result.exit_code,
                elapsed = ?started.elapsed(),
                "remote script finished"
            );
            Ok(result)
        })
    }
}

struct Shell {
    id: String,
}

impl Shell {
    async fn open(channel: &mut HttpChannel<'_>, poll: Duration) -> Result<Self, HypervError> {
        let envelope = soap::create_shell(channel.endpoint(), poll);
        let reply = channel.post(&envelope, poll, Resend::Once).await?;
        let body = expect_body(reply, channel, "create shell")?;
        let id = soap::parse_shell_id(&body).map_err(|message| channel.failure(message))?;
        debug!(shell_id = %id, "opened remote shell");
        Ok(Self { id })
    }

    async fn run_script(
        &self,
        channel: &mut HttpChannel<'_>,
        invocation: &ScriptInvocation,
        session: &Session,
        poll: Duration,
    ) -> Result<ExecutionResult, HypervError> {
        let script = powershell::with_preamble(invocation.body());
        let inline = powershell::inline_command(&script);
        if inline.len() <= MAX_INLINE_COMMAND {
            debug!(script = invocation.script(), invocation_id = %invocation.id(), "running script inline");
            return self.run_command(channel, &inline, poll).await;
        }

        let staged = StagedScript::new(session.staging().instantiate(), &script);
        debug!(
            script = invocation.script(),
            invocation_id = %invocation.id(),
            path = staged.path(),
            "staging oversized script"
        );
        let outcome = self.run_staged(channel, invocation.script(), &staged, poll).await;
        match self
            .run_command(channel, &staged.cleanup_command(), CLEANUP_TIMEOUT)
            .await
        {
            Ok(result) if result.exit_code == Some(0) => {}
            Ok(result) => warn!(path = staged.path(), exit_code = ?result.exit_code, "staged script cleanup failed"),
            Err(err) => warn!(path = staged.path(), error = %err, "staged script cleanup failed"),
        }
        outcome
    }

    async fn run_staged(
        &self,
        channel: &mut HttpChannel<'_>,
        script: &str,
        staged: &StagedScript,
        poll: Duration,
    ) -> Result<ExecutionResult, HypervError> {
        let steps = staged
            .upload_commands()
            .into_iter()
            .chain(std::iter::once(staged.materialize_command()));
        for step in steps {
            let result = self.run_command(channel, &step, poll).await?;
            if !result.is_success() {
                let stderr = format!("staging {} failed: {}", staged.path(), result.stderr.trim());
                return Err(HypervError::remote_script(
                    script,
                    result.exit_code,
                    result.stdout,
                    stderr,
                ));
            }
        }
        self.run_command(channel, &staged.run_command(), poll).await
    }

    async fn run_command(
        &self,
        channel: &mut HttpChannel<'_>,
        command_line: &str,
        poll: Duration,
    ) -> Result<ExecutionResult, HypervError> {
        let envelope = soap::command(channel.endpoint(), &self.id, command_line, poll);
        let reply = channel.post(&envelope, poll, Resend::Never).await?;
        let body = expect_body(reply, channel, "start command")?;
        let command_id =
            soap::parse_command_id(&body).map_err(|message| channel.failure(message))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = loop {
            let envelope = soap::receive(channel.endpoint(), &self.id, &command_id, poll);
            let chunk = match channel.post(&envelope, poll, Resend::Never).await? {
                SoapReply::Body(body) => {
                    soap::parse_receive(&body).map_err(|message| channel.failure(message))?
                }
                SoapReply::Fault(fault) if fault.is_operation_timeout() => continue,
                SoapReply::Fault(fault) => {
                    return Err(channel.failure(format!("receive fault: {}", fault.reason)));
                }
            };
            stdout.extend_from_slice(&chunk.stdout);
            stderr.extend_from_slice(&chunk.stderr);
            if chunk.done {
                break chunk.exit_code;
            }
        };

        let signal = soap::signal_terminate(channel.endpoint(), &self.id, &command_id, CLEANUP_TIMEOUT);
        if let Err(err) = channel.post(&signal, CLEANUP_TIMEOUT, Resend::Never).await {
            debug!(error = %err, "terminate signal failed");
        }

        Ok(ExecutionResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: powershell::clean_stderr(&String::from_utf8_lossy(&stderr)),
        })
    }

    async fn close(self, channel: &mut HttpChannel<'_>) {
        let envelope = soap::delete_shell(channel.endpoint(), &self.id, CLEANUP_TIMEOUT);
        match channel.post(&envelope, CLEANUP_TIMEOUT, Resend::Never).await {
            Ok(SoapReply::Body(_)) => debug!(shell_id = %self.id, "closed remote shell"),
            Ok(SoapReply::Fault(fault)) => {
                warn!(shell_id = %self.id, reason = %fault.reason, "remote shell did not close");
            }
            Err(err) => warn!(shell_id = %self.id, error = %err, "remote shell did not close"),
        }
    }
}

fn expect_body(
    reply: SoapReply,
    channel: &HttpChannel<'_>,
    step: &str,
) -> Result<String, HypervError> {
    match reply {
        SoapReply::Body(body) => Ok(body),
        SoapReply::Fault(fault) => Err(channel.failure(format!("{step} fault: {}", fault.reason))),
    }
}
