//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::error::HypervError;
use crate::transport::{ExecutionResult, ScriptInvocation, Transport, TransportFuture};

/// Host name reported by [`ScriptedTransport::new`].
pub const SCRIPTED_HOST: &str = "hyperv.test";

#[derive(Debug)]
struct Scripted {
    delay: Duration,
    outcome: Result<ExecutionResult, HypervError>,
}

#[derive(Debug, Default)]
struct State {
    responses: VecDeque<Scripted>,
    invocations: Vec<ScriptInvocation>,
}

/// Scripted transport that returns pre-seeded outcomes in FIFO order.
///
/// Used to drive deterministic script results without a Windows host.
/// Clones share the same queue and invocation log.
#[derive(Clone, Debug)]
pub struct ScriptedTransport {
    host: String,
    state: Arc<Mutex<State>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Creates a transport with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: SCRIPTED_HOST.to_owned(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn push(&self, delay: Duration, outcome: Result<ExecutionResult, HypervError>) {
        self.with_state(|state| state.responses.push_back(Scripted { delay, outcome }));
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<ScriptInvocation> {
        self.with_state(|state| state.invocations.clone())
    }

    /// Names of the scripts invoked so far, in call order.
    #[must_use]
    pub fn scripts(&self) -> Vec<String> {
        self.with_state(|state| {
            state
                .invocations
                .iter()
                .map(|invocation| invocation.script().to_owned())
                .collect()
        })
    }

    /// Number of responses not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.with_state(|state| state.responses.len())
    }

    /// Pushes a successful exit with no output.
    pub fn push_success(&self) {
        self.push(Duration::ZERO, Ok(ExecutionResult::success("")));
    }

    /// Pushes a successful exit with the given standard output.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push(Duration::ZERO, Ok(ExecutionResult::success(stdout)));
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i64, stderr: impl Into<String>) {
        self.push(Duration::ZERO, Ok(ExecutionResult::failure(code, stderr)));
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push(
            Duration::ZERO,
            Ok(ExecutionResult {
                exit_code: None,
                ..ExecutionResult::default()
            }),
        );
    }

    /// Pushes an explicit execution result.
    pub fn push_output(
        &self,
        exit_code: Option<i64>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(
            Duration::ZERO,
            Ok(ExecutionResult {
                exit_code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            }),
        );
    }

    /// Pushes a transport-level error.
    pub fn push_error(&self, error: HypervError) {
        self.push(Duration::ZERO, Err(error));
    }

    /// Pushes a successful result delivered only after `delay`.
    pub fn push_delayed(&self, delay: Duration, stdout: impl Into<String>) {
        self.push(delay, Ok(ExecutionResult::success(stdout)));
    }
}

impl Transport for ScriptedTransport {
    fn host(&self) -> &str {
        &self.host
    }

    fn execute<'a>(
        &'a self,
        invocation: &'a ScriptInvocation,
    ) -> TransportFuture<'a, ExecutionResult> {
        let next = self.with_state(|state| {
            state.invocations.push(invocation.clone());
            state.responses.pop_front()
        });
        Box::pin(async move {
            let Some(Scripted { delay, outcome }) = next else {
                return Err(HypervError::transport(
                    self.host.as_str(),
                    format!("no scripted response available for {}", invocation.script()),
                ));
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables for the guard's lifetime, restoring them on drop.
    pub async fn unset_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
