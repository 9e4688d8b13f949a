//! Generation 2 firmware settings.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, HypervClient, Presence, VmNameArgs, require};
use crate::client::enums::{ConsoleMode, IpProtocolPreference, OnOffState};
use crate::context::OperationContext;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

const GET_VM_FIRMWARE: ScriptTemplate = ScriptTemplate::new(
    "get_vm_firmware",
    &["vm_name"],
    r#"$vmName = {{ vm_name }}
$firmware = Get-VMFirmware -VMName $vmName -ErrorAction SilentlyContinue | Select-Object -First 1
if ($firmware) {
    @{
        EnableSecureBoot = [int]$firmware.SecureBoot
        SecureBootTemplate = $firmware.SecureBootTemplate
        PreferredNetworkBootProtocol = [int]$firmware.PreferredNetworkBootProtocol
        ConsoleMode = [int]$firmware.ConsoleMode
        PauseAfterBootFailure = [int]$firmware.PauseAfterBootFailure
    } | ConvertTo-Json -Compress
} else {
    '{}'
}
"#,
);

const UPDATE_VM_FIRMWARE: ScriptTemplate = ScriptTemplate::new(
    "update_vm_firmware",
    &["vm_name", "firmware"],
    r#"$vmName = {{ vm_name }}
$firmware = {{ firmware }}
$settings = @{
    VMName = $vmName
    EnableSecureBoot = $firmware.EnableSecureBoot
    PreferredNetworkBootProtocol = $firmware.PreferredNetworkBootProtocol
    ConsoleMode = $firmware.ConsoleMode
    PauseAfterBootFailure = $firmware.PauseAfterBootFailure
}
if ($firmware.SecureBootTemplate) {
    $settings.SecureBootTemplate = $firmware.SecureBootTemplate
}
Set-VMFirmware @settings
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[GET_VM_FIRMWARE, UPDATE_VM_FIRMWARE];

/// Firmware settings of a generation 2 machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct VmFirmware {
    /// Secure boot switch.
    pub enable_secure_boot: OnOffState,
    /// Secure boot template such as `MicrosoftUEFICertificateAuthority`.
    pub secure_boot_template: String,
    /// Protocol tried first for network boot.
    pub preferred_network_boot_protocol: IpProtocolPreference,
    /// Console redirection.
    pub console_mode: ConsoleMode,
    /// Whether the machine pauses when boot fails.
    pub pause_after_boot_failure: OnOffState,
}

impl Presence for VmFirmware {
    fn exists(&self) -> bool {
        !self.secure_boot_template.is_empty()
    }
}

#[derive(Serialize)]
struct UpdateFirmwareArgs<'a> {
    vm_name: &'a str,
    firmware: &'a VmFirmware,
}

/// Operations on firmware settings.
pub trait VmFirmwareClient: Send + Sync {
    /// Reads firmware settings of `vm_name`; generation 1 machines yield
    /// [`VmFirmware::default`].
    fn get_vm_firmware<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, VmFirmware>;

    /// Applies firmware settings to `vm_name`.
    fn update_vm_firmware<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        firmware: &'a VmFirmware,
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmFirmwareClient for HypervClient<T> {
    fn get_vm_firmware<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, VmFirmware> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_FIRMWARE, &VmNameArgs { vm_name })
                .await
        })
    }

    fn update_vm_firmware<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        firmware: &'a VmFirmware,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run(
                    ctx,
                    &UPDATE_VM_FIRMWARE,
                    &UpdateFirmwareArgs { vm_name, firmware },
                )
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    #[test]
    fn firmware_codes_decode_into_settings() {
        let firmware: VmFirmware = decode(
            "get_vm_firmware",
            r#"{"EnableSecureBoot":1,"SecureBootTemplate":"MicrosoftUEFICertificateAuthority","PreferredNetworkBootProtocol":1,"ConsoleMode":3,"PauseAfterBootFailure":0}"#,
        )
        .expect("payload should decode");
        assert!(firmware.exists());
        assert_eq!(firmware.enable_secure_boot, OnOffState::Off);
        assert_eq!(firmware.preferred_network_boot_protocol, IpProtocolPreference::Ipv6);
        assert_eq!(firmware.console_mode, ConsoleMode::None);
        assert_eq!(firmware.pause_after_boot_failure, OnOffState::On);
    }

    #[test]
    fn generation_one_machines_have_no_firmware() {
        let firmware: VmFirmware = decode("get_vm_firmware", "{}").expect("empty payload decodes");
        assert!(!firmware.exists());
    }
}
