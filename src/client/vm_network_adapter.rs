//! Virtual network adapters attached to machines.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, HypervClient, VmNameArgs, require};
use crate::client::enums::{OnOffState, PortMirroring};
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

/// Highest VLAN identifier accepted by access mode.
const MAX_VLAN_ID: u16 = 4094;

macro_rules! apply_adapter_settings {
    () => {
        r#"
$target = Get-VMNetworkAdapter -VMName $vmName -Name $adapter.Name
if ($adapter.SwitchName) {
    Connect-VMNetworkAdapter -VMNetworkAdapter $target -SwitchName $adapter.SwitchName
} else {
    Disconnect-VMNetworkAdapter -VMNetworkAdapter $target
}
$settings = @{
    VMNetworkAdapter = $target
    MacAddressSpoofing = $adapter.MacAddressSpoofing
    DhcpGuard = $adapter.DhcpGuard
    RouterGuard = $adapter.RouterGuard
    PortMirroring = $adapter.PortMirroring
}
if ($adapter.DynamicMacAddress) {
    $settings.DynamicMacAddress = $true
} elseif ($adapter.StaticMacAddress) {
    $settings.StaticMacAddress = $adapter.StaticMacAddress
}
Set-VMNetworkAdapter @settings
if ($adapter.VlanAccess) {
    Set-VMNetworkAdapterVlan -VMNetworkAdapter $target -Access -VlanId $adapter.VlanId
} else {
    Set-VMNetworkAdapterVlan -VMNetworkAdapter $target -Untagged
}
"#
    };
}

const CREATE_VM_NETWORK_ADAPTER: ScriptTemplate = ScriptTemplate::new(
    "create_vm_network_adapter",
    &["vm_name", "adapter"],
    concat!(
        r#"$vmName = {{ vm_name }}
$adapter = {{ adapter }}
$arguments = @{ VMName = $vmName; Name = $adapter.Name; IsLegacy = $adapter.IsLegacy }
Add-VMNetworkAdapter @arguments
"#,
        apply_adapter_settings!()
    ),
);

const GET_VM_NETWORK_ADAPTERS: ScriptTemplate = ScriptTemplate::new(
    "get_vm_network_adapters",
    &["vm_name"],
    r#"$vmName = {{ vm_name }}
$adapters = @(Get-VMNetworkAdapter -VMName $vmName -ErrorAction SilentlyContinue | ForEach-Object {
    $vlan = Get-VMNetworkAdapterVlan -VMNetworkAdapter $_
    @{
        Name = $_.Name
        SwitchName = $_.SwitchName
        IsLegacy = $_.IsLegacy
        DynamicMacAddress = $_.DynamicMacAddressEnabled
        StaticMacAddress = $_.MacAddress
        MacAddressSpoofing = [int]$_.MacAddressSpoofing
        DhcpGuard = [int]$_.DhcpGuard
        RouterGuard = [int]$_.RouterGuard
        PortMirroring = [int]$_.PortMirroringMode
        VlanAccess = ([string]$vlan.OperationMode -eq 'Access')
        VlanId = [int]$vlan.AccessVlanId
        IpAddresses = @($_.IPAddresses)
    }
})
ConvertTo-Json -InputObject $adapters -Compress -Depth 3
"#,
);

const UPDATE_VM_NETWORK_ADAPTER: ScriptTemplate = ScriptTemplate::new(
    "update_vm_network_adapter",
    &["vm_name", "adapter"],
    concat!(
        r#"$vmName = {{ vm_name }}
$adapter = {{ adapter }}
"#,
        apply_adapter_settings!()
    ),
);

const DELETE_VM_NETWORK_ADAPTER: ScriptTemplate = ScriptTemplate::new(
    "delete_vm_network_adapter",
    &["vm_name", "name"],
    r#"$vmName = {{ vm_name }}
$name = {{ name }}
Get-VMNetworkAdapter -VMName $vmName -Name $name -ErrorAction SilentlyContinue | Remove-VMNetworkAdapter
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[
    CREATE_VM_NETWORK_ADAPTER,
    GET_VM_NETWORK_ADAPTERS,
    UPDATE_VM_NETWORK_ADAPTER,
    DELETE_VM_NETWORK_ADAPTER,
];

/// One network adapter; adapters are keyed by name within their machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct VmNetworkAdapter {
    /// Adapter name within the machine.
    pub name: String,
    /// Switch the adapter connects to; empty leaves it disconnected.
    pub switch_name: String,
    /// Emulated legacy adapter (generation 1 only).
    pub is_legacy: bool,
    /// Host-assigned MAC address.
    pub dynamic_mac_address: bool,
    /// Fixed MAC address, twelve hex digits.
    pub static_mac_address: String,
    /// Lets the guest change its source MAC.
    pub mac_address_spoofing: OnOffState,
    /// Drops DHCP server traffic from the guest.
    pub dhcp_guard: OnOffState,
    /// Drops router advertisements from the guest.
    pub router_guard: OnOffState,
    /// Mirroring role of the port.
    pub port_mirroring: PortMirroring,
    /// Access mode VLAN tagging.
    pub vlan_access: bool,
    /// VLAN used in access mode.
    pub vlan_id: u16,
    /// Addresses reported by the guest; read only.
    pub ip_addresses: Vec<String>,
}

impl VmNetworkAdapter {
    /// Synthetic adapter with a dynamic MAC, connected to `switch_name`.
    pub fn new(name: impl Into<String>, switch_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            switch_name: switch_name.into(),
            dynamic_mac_address: true,
            mac_address_spoofing: OnOffState::Off,
            dhcp_guard: OnOffState::Off,
            router_guard: OnOffState::Off,
            ..Self::default()
        }
    }

    /// Checks the settings before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] for a blank name, a malformed or
    /// conflicting MAC address, or an out-of-range VLAN.
    pub fn validate(&self) -> Result<(), HypervError> {
        require("name", &self.name)?;
        let mac = self.static_mac_address.as_str();
        if self.dynamic_mac_address && !mac.is_empty() {
            return Err(HypervError::validation(
                "static_mac_address",
                "cannot be set together with dynamic_mac_address",
            ));
        }
        if !mac.is_empty() && (mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit())) {
            return Err(HypervError::validation(
                "static_mac_address",
                format!("{mac} is not twelve hex digits"),
            ));
        }
        if self.vlan_access && !(1..=MAX_VLAN_ID).contains(&self.vlan_id) {
            return Err(HypervError::validation(
                "vlan_id",
                format!("{} is outside 1..={MAX_VLAN_ID}", self.vlan_id),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct AdapterArgs<'a> {
    vm_name: &'a str,
    adapter: &'a VmNetworkAdapter,
}

#[derive(Serialize)]
struct DeleteAdapterArgs<'a> {
    vm_name: &'a str,
    name: &'a str,
}

/// Operations on network adapters.
pub trait VmNetworkAdapterClient: Send + Sync {
    /// Adds `adapter` to `vm_name`.
    fn create_vm_network_adapter<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        adapter: &'a VmNetworkAdapter,
    ) -> ClientFuture<'a, ()>;

    /// Lists the adapters of `vm_name`; an unknown machine yields none.
    fn get_vm_network_adapters<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmNetworkAdapter>>;

    /// Applies `adapter` to the adapter of the same name.
    fn update_vm_network_adapter<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        adapter: &'a VmNetworkAdapter,
    ) -> ClientFuture<'a, ()>;

    /// Removes the named adapter if present.
    fn delete_vm_network_adapter<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        name: &'a str,
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmNetworkAdapterClient for HypervClient<T> {
    fn create_vm_network_adapter<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        adapter: &'a VmNetworkAdapter,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            adapter.validate()?;
            self.executor
                .run(ctx, &CREATE_VM_NETWORK_ADAPTER, &AdapterArgs { vm_name, adapter })
                .await
        })
    }

    fn get_vm_network_adapters<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmNetworkAdapter>> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_NETWORK_ADAPTERS, &VmNameArgs { vm_name })
                .await
        })
    }

    fn update_vm_network_adapter<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        adapter: &'a VmNetworkAdapter,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            adapter.validate()?;
            self.executor
                .run(ctx, &UPDATE_VM_NETWORK_ADAPTER, &AdapterArgs { vm_name, adapter })
                .await
        })
    }

    fn delete_vm_network_adapter<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        name: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            require("name", name)?;
            self.executor
                .run(
                    ctx,
                    &DELETE_VM_NETWORK_ADAPTER,
                    &DeleteAdapterArgs { vm_name, name },
                )
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("00155D0A0B0C", true)]
    #[case("00:15:5D:0A:0B:0C", false)]
    #[case("00155D0A0B", false)]
    #[case("00155D0A0BZZ", false)]
    fn static_mac_must_be_twelve_hex_digits(#[case] mac: &str, #[case] valid: bool) {
        let adapter = VmNetworkAdapter {
            dynamic_mac_address: false,
            static_mac_address: mac.to_owned(),
            ..VmNetworkAdapter::new("lan", "wan")
        };
        assert_eq!(adapter.validate().is_ok(), valid);
    }

    #[test]
    fn access_vlan_needs_an_id() {
        let adapter = VmNetworkAdapter {
            vlan_access: true,
            ..VmNetworkAdapter::new("lan", "wan")
        };
        assert!(adapter.validate().is_err());
        let tagged = VmNetworkAdapter {
            vlan_id: 12,
            ..adapter
        };
        tagged.validate().expect("tagged adapter is valid");
    }

    #[test]
    fn single_adapter_payload_decodes_as_list() {
        let adapters: Vec<VmNetworkAdapter> = crate::decode::decode(
            "get_vm_network_adapters",
            r#"{"Name":"lan","SwitchName":"wan","DhcpGuard":0,"IpAddresses":"10.0.0.4"}"#,
        )
        .expect("payload should decode");
        let [adapter] = adapters.as_slice() else {
            panic!("expected one adapter, got {adapters:?}");
        };
        assert_eq!(adapter.dhcp_guard, OnOffState::On);
        assert_eq!(adapter.ip_addresses, ["10.0.0.4"]);
    }
}
