//! Virtual machines.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, HypervClient, NameArgs, Presence, require};
use crate::client::enums::{CheckpointType, StartAction, StopAction};
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

/// Hyper-V assigns memory in 2 MiB pages.
pub const MEMORY_ALIGNMENT: u64 = 2 * 1024 * 1024;

/// Startup memory of [`Vm::new`].
pub const DEFAULT_MEMORY_STARTUP_BYTES: u64 = 512 * 1024 * 1024;

macro_rules! apply_vm_settings {
    () => {
        r#"
$settings = @{ Name = $vm.Name; ProcessorCount = $vm.ProcessorCount; Notes = $vm.Notes }
if ($vm.AutomaticStartAction -gt 0) {
    $settings.AutomaticStartAction = $vm.AutomaticStartAction
    $settings.AutomaticStartDelay = $vm.AutomaticStartDelay
}
if ($vm.AutomaticStopAction -gt 0) {
    $settings.AutomaticStopAction = $vm.AutomaticStopAction
}
if ($vm.CheckpointType -gt 0) {
    $settings.CheckpointType = $vm.CheckpointType
}
if ($vm.DynamicMemory) {
    $settings.DynamicMemory = $true
    $settings.MemoryStartupBytes = $vm.MemoryStartupBytes
    if ($vm.MemoryMinimumBytes -gt 0) {
        $settings.MemoryMinimumBytes = $vm.MemoryMinimumBytes
    }
    if ($vm.MemoryMaximumBytes -gt 0) {
        $settings.MemoryMaximumBytes = $vm.MemoryMaximumBytes
    }
} else {
    $settings.StaticMemory = $true
    $settings.MemoryStartupBytes = $vm.MemoryStartupBytes
}
if ($vm.SmartPagingFilePath) {
    $settings.SmartPagingFilePath = $vm.SmartPagingFilePath
}
if ($vm.SnapshotFileLocation) {
    $settings.SnapshotFileLocation = $vm.SnapshotFileLocation
}
$settings.GuestControlledCacheTypes = $vm.GuestControlledCacheTypes
Set-VM @settings
"#
    };
}

const CREATE_VM: ScriptTemplate = ScriptTemplate::new(
    "create_vm",
    &["vm"],
    concat!(
        r#"$vm = {{ vm }}
$arguments = @{ Name = $vm.Name; Generation = $vm.Generation; MemoryStartupBytes = $vm.MemoryStartupBytes; NoVHD = $true }
if ($vm.Path) {
    $arguments.Path = $vm.Path
}
New-VM @arguments | Out-Null
"#,
        apply_vm_settings!()
    ),
);

const GET_VM: ScriptTemplate = ScriptTemplate::new(
    "get_vm",
    &["name"],
    r#"$name = {{ name }}
$vmObject = Get-VM -Name $name -ErrorAction SilentlyContinue | Select-Object -First 1
if ($vmObject) {
    @{
        Name = $vmObject.Name
        Generation = $vmObject.Generation
        Path = $vmObject.Path
        Notes = $vmObject.Notes
        ProcessorCount = $vmObject.ProcessorCount
        DynamicMemory = $vmObject.DynamicMemoryEnabled
        StaticMemory = -not $vmObject.DynamicMemoryEnabled
        MemoryStartupBytes = $vmObject.MemoryStartup
        MemoryMinimumBytes = $vmObject.MemoryMinimum
        MemoryMaximumBytes = $vmObject.MemoryMaximum
        AutomaticStartAction = [int]$vmObject.AutomaticStartAction
        AutomaticStartDelay = $vmObject.AutomaticStartDelay
        AutomaticStopAction = [int]$vmObject.AutomaticStopAction
        CheckpointType = [int]$vmObject.CheckpointType
        GuestControlledCacheTypes = $vmObject.GuestControlledCacheTypes
        SmartPagingFilePath = $vmObject.SmartPagingFilePath
        SnapshotFileLocation = $vmObject.SnapshotFileLocation
    } | ConvertTo-Json -Compress
} else {
    '{}'
}
"#,
);

const UPDATE_VM: ScriptTemplate = ScriptTemplate::new(
    "update_vm",
    &["name", "vm"],
    concat!(
        r#"$name = {{ name }}
$vm = {{ vm }}
if ($name -ne $vm.Name) {
    Rename-VM -Name $name -NewName $vm.Name
}
"#,
        apply_vm_settings!()
    ),
);

const DELETE_VM: ScriptTemplate = ScriptTemplate::new(
    "delete_vm",
    &["name"],
    r#"$name = {{ name }}
$vmObject = Get-VM -Name $name -ErrorAction SilentlyContinue | Select-Object -First 1
if ($vmObject) {
    if ($vmObject.State -ne 'Off') {
        Stop-VM -VM $vmObject -TurnOff -Force
    }
    Remove-VM -VM $vmObject -Force
}
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[CREATE_VM, GET_VM, UPDATE_VM, DELETE_VM];

/// Virtual machine settings, used both as desired state and lookup result.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Vm {
    /// Machine name, unique on the host.
    pub name: String,
    /// Hardware generation, 1 or 2.
    pub generation: u8,
    /// Folder holding the configuration files.
    pub path: String,
    /// Free-form notes.
    pub notes: String,
    /// Virtual processor count.
    pub processor_count: u32,
    /// Fixed memory allocation.
    pub static_memory: bool,
    /// Ballooned memory allocation.
    pub dynamic_memory: bool,
    /// Memory at boot in bytes.
    pub memory_startup_bytes: u64,
    /// Dynamic memory floor in bytes.
    pub memory_minimum_bytes: u64,
    /// Dynamic memory ceiling in bytes.
    pub memory_maximum_bytes: u64,
    /// Behaviour when the host starts.
    pub automatic_start_action: StartAction,
    /// Delay in seconds before the start action runs.
    pub automatic_start_delay: u32,
    /// Behaviour when the host stops.
    pub automatic_stop_action: StopAction,
    /// Checkpoint flavour.
    pub checkpoint_type: CheckpointType,
    /// Whether the guest may control disk cache types.
    pub guest_controlled_cache_types: bool,
    /// Folder for the smart paging file.
    pub smart_paging_file_path: String,
    /// Folder for checkpoint files.
    pub snapshot_file_location: String,
}

impl Vm {
    /// Generation 2 machine with one processor and 512 MiB of static memory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: 2,
            processor_count: 1,
            static_memory: true,
            memory_startup_bytes: DEFAULT_MEMORY_STARTUP_BYTES,
            automatic_start_action: StartAction::StartIfRunning,
            automatic_stop_action: StopAction::Save,
            checkpoint_type: CheckpointType::Production,
            ..Self::default()
        }
    }

    /// Checks the settings before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] for a blank name, an unknown
    /// generation, zero processors, misaligned memory sizes, or both memory
    /// modes at once.
    pub fn validate(&self) -> Result<(), HypervError> {
        require("name", &self.name)?;
        if !matches!(self.generation, 1 | 2) {
            return Err(HypervError::validation(
                "generation",
                format!("{} is not 1 or 2", self.generation),
            ));
        }
        if self.processor_count == 0 {
            return Err(HypervError::validation("processor_count", "must be at least 1"));
        }
        if self.static_memory && self.dynamic_memory {
            return Err(HypervError::validation(
                "dynamic_memory",
                "cannot be combined with static_memory",
            ));
        }
        for (field, value) in [
            ("memory_startup_bytes", self.memory_startup_bytes),
            ("memory_minimum_bytes", self.memory_minimum_bytes),
            ("memory_maximum_bytes", self.memory_maximum_bytes),
        ] {
            if value & (MEMORY_ALIGNMENT - 1) != 0 {
                return Err(HypervError::validation(
                    field,
                    format!("{value} is not a multiple of {MEMORY_ALIGNMENT}"),
                ));
            }
        }
        if self.memory_startup_bytes == 0 {
            return Err(HypervError::validation("memory_startup_bytes", "must be set"));
        }
        Ok(())
    }
}

impl Presence for Vm {
    fn exists(&self) -> bool {
        !self.name.is_empty()
    }
}

#[derive(Serialize)]
struct VmArgs<'a> {
    vm: &'a Vm,
}

#[derive(Serialize)]
struct UpdateVmArgs<'a> {
    name: &'a str,
    vm: &'a Vm,
}

/// Operations on virtual machines.
pub trait VmClient: Send + Sync {
    /// Creates a machine without disks and applies its settings.
    fn create_vm<'a>(&'a self, ctx: &'a OperationContext, vm: &'a Vm) -> ClientFuture<'a, ()>;

    /// Reads a machine; an unknown name yields [`Vm::default`].
    fn get_vm<'a>(&'a self, ctx: &'a OperationContext, name: &'a str) -> ClientFuture<'a, Vm>;

    /// Applies `vm` to the machine currently called `name`, renaming it
    /// when the names differ.
    fn update_vm<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
        vm: &'a Vm,
    ) -> ClientFuture<'a, ()>;

    /// Turns the machine off and removes it.
    fn delete_vm<'a>(&'a self, ctx: &'a OperationContext, name: &'a str) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmClient for HypervClient<T> {
    fn create_vm<'a>(&'a self, ctx: &'a OperationContext, vm: &'a Vm) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            vm.validate()?;
            self.executor.run(ctx, &CREATE_VM, &VmArgs { vm }).await
        })
    }

    fn get_vm<'a>(&'a self, ctx: &'a OperationContext, name: &'a str) -> ClientFuture<'a, Vm> {
        Box::pin(async move {
            require("name", name)?;
            self.executor
                .run_with_result(ctx, &GET_VM, &NameArgs { name })
                .await
        })
    }

    fn update_vm<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
        vm: &'a Vm,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("name", name)?;
            vm.validate()?;
            self.executor
                .run(ctx, &UPDATE_VM, &UpdateVmArgs { name, vm })
                .await
        })
    }

    fn delete_vm<'a>(&'a self, ctx: &'a OperationContext, name: &'a str) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("name", name)?;
            self.executor.run(ctx, &DELETE_VM, &NameArgs { name }).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        Vm::new("web01").validate().expect("defaults should validate");
    }

    #[rstest]
    #[case::generation(Vm { generation: 3, ..Vm::new("a") }, "generation")]
    #[case::processors(Vm { processor_count: 0, ..Vm::new("a") }, "processor_count")]
    #[case::both_modes(Vm { dynamic_memory: true, ..Vm::new("a") }, "dynamic_memory")]
    #[case::misaligned(Vm { memory_startup_bytes: 1000, ..Vm::new("a") }, "memory_startup_bytes")]
    #[case::blank(Vm::new(""), "name")]
    fn rejects_invalid_settings(#[case] vm: Vm, #[case] expected: &str) {
        let err = vm.validate().expect_err("settings should be rejected");
        assert!(
            matches!(err, HypervError::Validation { ref field, .. } if field == expected),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn decodes_lookup_payload() {
        let payload = r#"{"Name":"web01","Generation":2,"ProcessorCount":4,"DynamicMemory":false,
            "StaticMemory":true,"MemoryStartupBytes":1073741824,"AutomaticStartAction":3,
            "AutomaticStopAction":3,"CheckpointType":3,"Notes":null,"Path":"C:\\VMs"}"#;
        let vm: Vm = crate::decode::decode("get_vm", payload).expect("payload should decode");
        assert_eq!(vm.processor_count, 4);
        assert_eq!(vm.automatic_start_action, StartAction::StartIfRunning);
        assert_eq!(vm.checkpoint_type, CheckpointType::Production);
        assert!(vm.notes.is_empty());
        assert!(vm.exists());
    }
}
