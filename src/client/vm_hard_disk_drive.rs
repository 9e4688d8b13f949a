//! Hard disk drives attached to machines.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, ControllerSlot, HypervClient, VmNameArgs, require};
use crate::client::enums::ControllerType;
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

macro_rules! drive_arguments {
    () => {
        r#"
if ($drive.DiskNumber -ge 0) {
    $arguments.DiskNumber = $drive.DiskNumber
} elseif ($drive.Path) {
    $arguments.Path = $drive.Path
}
if ($drive.ResourcePoolName) {
    $arguments.ResourcePoolName = $drive.ResourcePoolName
}
if ($drive.ControllerType -eq 1) {
    $arguments.SupportPersistentReservations = $drive.SupportPersistentReservations
}
if ($drive.MaximumIops -gt 0) {
    $arguments.MaximumIOPS = $drive.MaximumIops
}
if ($drive.MinimumIops -gt 0) {
    $arguments.MinimumIOPS = $drive.MinimumIops
}
"#
    };
}

const CREATE_VM_HARD_DISK_DRIVE: ScriptTemplate = ScriptTemplate::new(
    "create_vm_hard_disk_drive",
    &["vm_name", "drive"],
    concat!(
        r#"$vmName = {{ vm_name }}
$drive = {{ drive }}
$arguments = @{
    VMName = $vmName
    ControllerType = $drive.ControllerType
    ControllerNumber = $drive.ControllerNumber
    ControllerLocation = $drive.ControllerLocation
}
"#,
        drive_arguments!(),
        "Add-VMHardDiskDrive @arguments\n"
    ),
);

const GET_VM_HARD_DISK_DRIVES: ScriptTemplate = ScriptTemplate::new(
    "get_vm_hard_disk_drives",
    &["vm_name"],
    r#"$vmName = {{ vm_name }}
$drives = @(Get-VMHardDiskDrive -VMName $vmName -ErrorAction SilentlyContinue | ForEach-Object {
    $diskNumber = -1
    if ($null -ne $_.DiskNumber) {
        $diskNumber = $_.DiskNumber
    }
    @{
        ControllerType = [int]$_.ControllerType
        ControllerNumber = $_.ControllerNumber
        ControllerLocation = $_.ControllerLocation
        Path = $_.Path
        DiskNumber = $diskNumber
        ResourcePoolName = $_.PoolName
        SupportPersistentReservations = $_.SupportPersistentReservations
        MaximumIops = $_.MaximumIOPS
        MinimumIops = $_.MinimumIOPS
    }
})
ConvertTo-Json -InputObject $drives -Compress
"#,
);

const UPDATE_VM_HARD_DISK_DRIVE: ScriptTemplate = ScriptTemplate::new(
    "update_vm_hard_disk_drive",
    &["vm_name", "controller_type", "slot", "drive"],
    concat!(
        r#"$vmName = {{ vm_name }}
$controllerType = {{ controller_type }}
$slot = {{ slot }}
$drive = {{ drive }}
$current = Get-VMHardDiskDrive -VMName $vmName -ControllerType $controllerType -ControllerNumber $slot.ControllerNumber -ControllerLocation $slot.ControllerLocation
if (-not $current) {
    throw "no hard disk drive at controller $($slot.ControllerNumber) location $($slot.ControllerLocation)"
}
$arguments = @{
    VMHardDiskDrive = $current
    ToControllerType = $drive.ControllerType
    ToControllerNumber = $drive.ControllerNumber
    ToControllerLocation = $drive.ControllerLocation
}
"#,
        drive_arguments!(),
        "Set-VMHardDiskDrive @arguments\n"
    ),
);

const DELETE_VM_HARD_DISK_DRIVE: ScriptTemplate = ScriptTemplate::new(
    "delete_vm_hard_disk_drive",
    &["vm_name", "controller_type", "slot"],
    r#"$vmName = {{ vm_name }}
$controllerType = {{ controller_type }}
$slot = {{ slot }}
Get-VMHardDiskDrive -VMName $vmName -ControllerType $controllerType -ControllerNumber $slot.ControllerNumber -ControllerLocation $slot.ControllerLocation -ErrorAction SilentlyContinue |
    Remove-VMHardDiskDrive
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[
    CREATE_VM_HARD_DISK_DRIVE,
    GET_VM_HARD_DISK_DRIVES,
    UPDATE_VM_HARD_DISK_DRIVE,
    DELETE_VM_HARD_DISK_DRIVE,
];

/// One hard disk drive, backed by a virtual disk file or a host disk.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct VmHardDiskDrive {
    /// Bus the drive sits on.
    pub controller_type: ControllerType,
    /// Controller index.
    pub controller_number: u32,
    /// Position on the controller.
    pub controller_location: u32,
    /// Virtual disk file.
    pub path: String,
    /// Pass-through host disk; `-1` when the drive uses `path`.
    pub disk_number: i32,
    /// Resource pool backing the drive.
    pub resource_pool_name: String,
    /// SCSI persistent reservations for guest clusters.
    pub support_persistent_reservations: bool,
    /// IOPS ceiling; `0` is unlimited.
    pub maximum_iops: u64,
    /// IOPS floor; `0` is none.
    pub minimum_iops: u64,
}

impl Default for VmHardDiskDrive {
    fn default() -> Self {
        Self {
            controller_type: ControllerType::default(),
            controller_number: 0,
            controller_location: 0,
            path: String::new(),
            disk_number: -1,
            resource_pool_name: String::new(),
            support_persistent_reservations: false,
            maximum_iops: 0,
            minimum_iops: 0,
        }
    }
}

impl VmHardDiskDrive {
    /// SCSI drive at `slot` backed by the virtual disk at `path`.
    pub fn scsi(slot: ControllerSlot, path: impl Into<String>) -> Self {
        Self {
            controller_type: ControllerType::Scsi,
            controller_number: slot.controller_number,
            controller_location: slot.controller_location,
            path: path.into(),
            ..Self::default()
        }
    }

    /// Slot occupied by the drive.
    #[must_use]
    pub const fn slot(&self) -> ControllerSlot {
        ControllerSlot::new(self.controller_number, self.controller_location)
    }

    /// Checks the settings before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] when both or neither of `path`
    /// and `disk_number` are set, when the IOPS floor exceeds the ceiling,
    /// or when persistent reservations are requested on an IDE drive.
    pub fn validate(&self) -> Result<(), HypervError> {
        let has_path = !self.path.trim().is_empty();
        let has_disk = self.disk_number >= 0;
        if has_path == has_disk {
            return Err(HypervError::validation(
                "path",
                "exactly one of path and disk_number must be set",
            ));
        }
        if self.maximum_iops > 0 && self.minimum_iops > self.maximum_iops {
            return Err(HypervError::validation(
                "minimum_iops",
                "cannot exceed maximum_iops",
            ));
        }
        if self.support_persistent_reservations && self.controller_type == ControllerType::Ide {
            return Err(HypervError::validation(
                "support_persistent_reservations",
                "requires a SCSI controller",
            ));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct DriveArgs<'a> {
    vm_name: &'a str,
    drive: &'a VmHardDiskDrive,
}

#[derive(Serialize)]
struct UpdateDriveArgs<'a> {
    vm_name: &'a str,
    controller_type: ControllerType,
    slot: ControllerSlot,
    drive: &'a VmHardDiskDrive,
}

#[derive(Serialize)]
struct SlotArgs<'a> {
    vm_name: &'a str,
    controller_type: ControllerType,
    slot: ControllerSlot,
}

/// Operations on hard disk drives.
pub trait VmHardDiskDriveClient: Send + Sync {
    /// Adds `drive` to `vm_name`.
    fn create_vm_hard_disk_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        drive: &'a VmHardDiskDrive,
    ) -> ClientFuture<'a, ()>;

    /// Lists the hard disk drives of `vm_name`.
    fn get_vm_hard_disk_drives<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmHardDiskDrive>>;

    /// Moves or reconfigures the drive at `slot` on a `controller_type` bus.
    fn update_vm_hard_disk_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        controller_type: ControllerType,
        slot: ControllerSlot,
        drive: &'a VmHardDiskDrive,
    ) -> ClientFuture<'a, ()>;

    /// Detaches the drive at `slot` if present; the disk file is kept.
    fn delete_vm_hard_disk_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        controller_type: ControllerType,
        slot: ControllerSlot,
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmHardDiskDriveClient for HypervClient<T> {
    fn create_vm_hard_disk_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        drive: &'a VmHardDiskDrive,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            drive.validate()?;
            self.executor
                .run(ctx, &CREATE_VM_HARD_DISK_DRIVE, &DriveArgs { vm_name, drive })
                .await
        })
    }

    fn get_vm_hard_disk_drives<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmHardDiskDrive>> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_HARD_DISK_DRIVES, &VmNameArgs { vm_name })
                .await
        })
    }

    fn update_vm_hard_disk_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        controller_type: ControllerType,
        slot: ControllerSlot,
        drive: &'a VmHardDiskDrive,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            drive.validate()?;
            self.executor
                .run(
                    ctx,
                    &UPDATE_VM_HARD_DISK_DRIVE,
                    &UpdateDriveArgs {
                        vm_name,
                        controller_type,
                        slot,
                        drive,
                    },
                )
                .await
        })
    }

    fn delete_vm_hard_disk_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        controller_type: ControllerType,
        slot: ControllerSlot,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run(
                    ctx,
                    &DELETE_VM_HARD_DISK_DRIVE,
                    &SlotArgs {
                        vm_name,
                        controller_type,
                        slot,
                    },
                )
                .await
        })
    }
}
