//! Runtime state of virtual machines.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ClientFuture, HypervClient, NameArgs, Presence, require};
use crate::client::enums::VmState;
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

/// Time reserved after the state wait for the script to report back.
const REPORT_MARGIN: Duration = Duration::from_secs(5);

const GET_VM_STATUS: ScriptTemplate = ScriptTemplate::new(
    "get_vm_status",
    &["name"],
    r#"$name = {{ name }}
$vmObject = Get-VM -Name $name -ErrorAction SilentlyContinue | Select-Object -First 1
if ($vmObject) {
    @{ State = [int]$vmObject.State } | ConvertTo-Json -Compress
} else {
    '{}'
}
"#,
);

const UPDATE_VM_STATUS: ScriptTemplate = ScriptTemplate::new(
    "update_vm_status",
    &["name", "state", "wait_seconds"],
    r#"$name = {{ name }}
$state = {{ state }}
$waitSeconds = {{ wait_seconds }}
$vmObject = Get-VM -Name $name
$current = [int]$vmObject.State
if ($current -ne $state) {
    switch ($state) {
        2 {
            if ($current -eq 9) {
                Resume-VM -VM $vmObject
            } else {
                Start-VM -VM $vmObject
            }
        }
        3 {
            Stop-VM -VM $vmObject -TurnOff -Force
        }
        6 {
            Save-VM -VM $vmObject
        }
        9 {
            Suspend-VM -VM $vmObject
        }
        default {
            throw "state $state cannot be requested"
        }
    }
}
$deadline = (Get-Date).AddSeconds($waitSeconds)
while ([int](Get-VM -Name $name).State -ne $state) {
    if ((Get-Date) -gt $deadline) {
        throw "virtual machine $name did not reach state $state within $waitSeconds seconds"
    }
    Start-Sleep -Seconds 1
}
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[GET_VM_STATUS, UPDATE_VM_STATUS];

/// Runtime state of one machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct VmStatus {
    /// Current state; [`VmState::Unknown`] when the machine is absent.
    pub state: VmState,
}

impl Presence for VmStatus {
    fn exists(&self) -> bool {
        self.state != VmState::Unknown
    }
}

#[derive(Serialize)]
struct UpdateStatusArgs<'a> {
    name: &'a str,
    state: VmState,
    wait_seconds: u64,
}

/// Operations on machine runtime state.
pub trait VmStatusClient: Send + Sync {
    /// Reads the current state.
    fn get_vm_status<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
    ) -> ClientFuture<'a, VmStatus>;

    /// Drives the machine to `state` and waits until it gets there, bounded
    /// by the operation deadline.
    fn update_vm_status<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
        state: VmState,
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmStatusClient for HypervClient<T> {
    fn get_vm_status<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
    ) -> ClientFuture<'a, VmStatus> {
        Box::pin(async move {
            require("name", name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_STATUS, &NameArgs { name })
                .await
        })
    }

    fn update_vm_status<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
        state: VmState,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("name", name)?;
            if !state.is_requestable() {
                return Err(HypervError::validation(
                    "state",
                    format!("{state} cannot be requested; use Running, Off, Paused, or Saved"),
                ));
            }
            let budget = ctx.deadline_or(self.executor.default_timeout());
            let wait_seconds = budget.saturating_sub(REPORT_MARGIN).as_secs().max(1);
            info!(vm = name, %state, wait_seconds, "changing virtual machine state");
            self.executor
                .run(
                    ctx,
                    &UPDATE_VM_STATUS,
                    &UpdateStatusArgs {
                        name,
                        state,
                        wait_seconds,
                    },
                )
                .await
        })
    }
}
