//! DVD drives attached to machines, keyed by controller slot.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, ControllerSlot, HypervClient, VmNameArgs, require};
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

const CREATE_VM_DVD_DRIVE: ScriptTemplate = ScriptTemplate::new(
    "create_vm_dvd_drive",
    &["vm_name", "drive"],
    r#"$vmName = {{ vm_name }}
$drive = {{ drive }}
$arguments = @{
    VMName = $vmName
    ControllerNumber = $drive.ControllerNumber
    ControllerLocation = $drive.ControllerLocation
}
if ($drive.Path) {
    $arguments.Path = $drive.Path
}
if ($drive.ResourcePoolName) {
    $arguments.ResourcePoolName = $drive.ResourcePoolName
}
Add-VMDvdDrive @arguments
"#,
);

const GET_VM_DVD_DRIVES: ScriptTemplate = ScriptTemplate::new(
    "get_vm_dvd_drives",
    &["vm_name"],
    r#"$vmName = {{ vm_name }}
$drives = @(Get-VMDvdDrive -VMName $vmName -ErrorAction SilentlyContinue | ForEach-Object {
    @{
        ControllerNumber = $_.ControllerNumber
        ControllerLocation = $_.ControllerLocation
        Path = $_.Path
        ResourcePoolName = $_.PoolName
    }
})
ConvertTo-Json -InputObject $drives -Compress
"#,
);

const UPDATE_VM_DVD_DRIVE: ScriptTemplate = ScriptTemplate::new(
    "update_vm_dvd_drive",
    &["vm_name", "slot", "drive"],
    r#"$vmName = {{ vm_name }}
$slot = {{ slot }}
$drive = {{ drive }}
$current = Get-VMDvdDrive -VMName $vmName -ControllerNumber $slot.ControllerNumber -ControllerLocation $slot.ControllerLocation
if (-not $current) {
    throw "no DVD drive at controller $($slot.ControllerNumber) location $($slot.ControllerLocation)"
}
$arguments = @{
    VMDvdDrive = $current
    ToControllerNumber = $drive.ControllerNumber
    ToControllerLocation = $drive.ControllerLocation
    Path = $drive.Path
}
if ($drive.ResourcePoolName) {
    $arguments.ResourcePoolName = $drive.ResourcePoolName
}
Set-VMDvdDrive @arguments
"#,
);

const DELETE_VM_DVD_DRIVE: ScriptTemplate = ScriptTemplate::new(
    "delete_vm_dvd_drive",
    &["vm_name", "slot"],
    r#"$vmName = {{ vm_name }}
$slot = {{ slot }}
Get-VMDvdDrive -VMName $vmName -ControllerNumber $slot.ControllerNumber -ControllerLocation $slot.ControllerLocation -ErrorAction SilentlyContinue |
    Remove-VMDvdDrive
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[
    CREATE_VM_DVD_DRIVE,
    GET_VM_DVD_DRIVES,
    UPDATE_VM_DVD_DRIVE,
    DELETE_VM_DVD_DRIVE,
];

/// One DVD drive.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct VmDvdDrive {
    /// Controller index.
    pub controller_number: u32,
    /// Position on the controller.
    pub controller_location: u32,
    /// Mounted ISO; empty leaves the drive empty.
    pub path: String,
    /// Resource pool backing the drive.
    pub resource_pool_name: String,
}

impl VmDvdDrive {
    /// Slot occupied by the drive.
    #[must_use]
    pub const fn slot(&self) -> ControllerSlot {
        ControllerSlot::new(self.controller_number, self.controller_location)
    }
}

#[derive(Serialize)]
struct DriveArgs<'a> {
    vm_name: &'a str,
    drive: &'a VmDvdDrive,
}

#[derive(Serialize)]
struct UpdateDriveArgs<'a> {
    vm_name: &'a str,
    slot: ControllerSlot,
    drive: &'a VmDvdDrive,
}

#[derive(Serialize)]
struct SlotArgs<'a> {
    vm_name: &'a str,
    slot: ControllerSlot,
}

fn reject_iso_without_extension(path: &str) -> Result<(), HypervError> {
    if path.is_empty() || path.to_ascii_lowercase().ends_with(".iso") {
        return Ok(());
    }
    Err(HypervError::validation(
        "path",
        format!("{path} is not an ISO image"),
    ))
}

/// Operations on DVD drives.
pub trait VmDvdDriveClient: Send + Sync {
    /// Adds `drive` to `vm_name`.
    fn create_vm_dvd_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        drive: &'a VmDvdDrive,
    ) -> ClientFuture<'a, ()>;

    /// Lists the DVD drives of `vm_name`.
    fn get_vm_dvd_drives<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmDvdDrive>>;

    /// Moves or remounts the drive currently at `slot`.
    fn update_vm_dvd_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        slot: ControllerSlot,
        drive: &'a VmDvdDrive,
    ) -> ClientFuture<'a, ()>;

    /// Removes the drive at `slot` if present.
    fn delete_vm_dvd_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        slot: ControllerSlot,
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmDvdDriveClient for HypervClient<T> {
    fn create_vm_dvd_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        drive: &'a VmDvdDrive,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            reject_iso_without_extension(&drive.path)?;
            self.executor
                .run(ctx, &CREATE_VM_DVD_DRIVE, &DriveArgs { vm_name, drive })
                .await
        })
    }

    fn get_vm_dvd_drives<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmDvdDrive>> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_DVD_DRIVES, &VmNameArgs { vm_name })
                .await
        })
    }

    fn update_vm_dvd_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        slot: ControllerSlot,
        drive: &'a VmDvdDrive,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            reject_iso_without_extension(&drive.path)?;
            self.executor
                .run(
                    ctx,
                    &UPDATE_VM_DVD_DRIVE,
                    &UpdateDriveArgs {
                        vm_name,
                        slot,
                        drive,
                    },
                )
                .await
        })
    }

    fn delete_vm_dvd_drive<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        slot: ControllerSlot,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run(ctx, &DELETE_VM_DVD_DRIVE, &SlotArgs { vm_name, slot })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_iso_images_mount() {
        reject_iso_without_extension("").expect("empty drive is allowed");
        reject_iso_without_extension(r"C:\iso\seed.ISO").expect("upper-case extension");
        assert!(reject_iso_without_extension(r"C:\disks\root.vhdx").is_err());
    }

    #[test]
    fn drive_reports_its_slot() {
        let drive = VmDvdDrive {
            controller_number: 1,
            controller_location: 3,
            ..VmDvdDrive::default()
        };
        assert_eq!(drive.slot(), ControllerSlot::new(1, 3));
    }
}
