//! Virtual switches.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, HypervClient, NameArgs, Presence, require};
use crate::client::enums::VmSwitchType;
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

macro_rules! apply_switch_settings {
    () => {
        r#"
$settings = @{ Name = $switch.Name; Notes = $switch.Notes }
if ($switch.NetAdapterNames.Count -gt 0) {
    $settings.AllowManagementOS = $switch.AllowManagementOs
}
if ($switch.DefaultFlowMinimumBandwidthWeight -gt 0) {
    $settings.DefaultFlowMinimumBandwidthWeight = $switch.DefaultFlowMinimumBandwidthWeight
}
Set-VMSwitch @settings
"#
    };
}

const CREATE_VM_SWITCH: ScriptTemplate = ScriptTemplate::new(
    "create_vm_switch",
    &["switch"],
    concat!(
        r#"$switch = {{ switch }}
$arguments = @{ Name = $switch.Name }
if ($switch.NetAdapterNames.Count -gt 0) {
    $arguments.NetAdapterName = $switch.NetAdapterNames
    $arguments.EnableEmbeddedTeaming = $switch.EnableEmbeddedTeaming
    $arguments.EnableIov = $switch.EnableIov
    if ($switch.DefaultFlowMinimumBandwidthWeight -gt 0) {
        $arguments.MinimumBandwidthMode = 'Weight'
    }
} else {
    $arguments.SwitchType = $switch.SwitchType
}
New-VMSwitch @arguments | Out-Null
"#,
        apply_switch_settings!()
    ),
);

const GET_VM_SWITCH: ScriptTemplate = ScriptTemplate::new(
    "get_vm_switch",
    &["name"],
    r#"$name = {{ name }}
$switchObject = Get-VMSwitch -Name $name -ErrorAction SilentlyContinue | Select-Object -First 1
if ($switchObject) {
    $adapters = @()
    if ($switchObject.NetAdapterInterfaceDescriptions) {
        $adapters = @(Get-NetAdapter -InterfaceDescription $switchObject.NetAdapterInterfaceDescriptions | ForEach-Object { $_.Name })
    }
    @{
        Name = $switchObject.Name
        Notes = $switchObject.Notes
        SwitchType = [int]$switchObject.SwitchType
        AllowManagementOs = $switchObject.AllowManagementOS
        NetAdapterNames = $adapters
        EnableEmbeddedTeaming = $switchObject.EmbeddedTeamingEnabled
        EnableIov = $switchObject.IovEnabled
        DefaultFlowMinimumBandwidthWeight = $switchObject.DefaultFlowMinimumBandwidthWeight
    } | ConvertTo-Json -Compress
} else {
    '{}'
}
"#,
);

const UPDATE_VM_SWITCH: ScriptTemplate = ScriptTemplate::new(
    "update_vm_switch",
    &["name", "switch"],
    concat!(
        r#"$name = {{ name }}
$switch = {{ switch }}
if ($name -ne $switch.Name) {
    Rename-VMSwitch -Name $name -NewName $switch.Name
}
if ($switch.NetAdapterNames.Count -gt 0) {
    Set-VMSwitch -Name $switch.Name -NetAdapterName $switch.NetAdapterNames
} else {
    Set-VMSwitch -Name $switch.Name -SwitchType $switch.SwitchType
}
"#,
        apply_switch_settings!()
    ),
);

const DELETE_VM_SWITCH: ScriptTemplate = ScriptTemplate::new(
    "delete_vm_switch",
    &["name"],
    r#"$name = {{ name }}
Get-VMSwitch -Name $name -ErrorAction SilentlyContinue | Remove-VMSwitch -Force
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[
    CREATE_VM_SWITCH,
    GET_VM_SWITCH,
    UPDATE_VM_SWITCH,
    DELETE_VM_SWITCH,
];

/// Virtual switch settings, used both as desired state and lookup result.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct VmSwitch {
    /// Switch name, unique on the host.
    pub name: String,
    /// Free-form notes.
    pub notes: String,
    /// Connectivity; switches bound to adapters are always external.
    pub switch_type: VmSwitchType,
    /// Whether the host shares the bound adapters.
    pub allow_management_os: bool,
    /// Physical adapters the switch is bound to.
    pub net_adapter_names: Vec<String>,
    /// Switch embedded teaming across the bound adapters.
    pub enable_embedded_teaming: bool,
    /// Single-root I/O virtualisation.
    pub enable_iov: bool,
    /// Bandwidth weight for flows without their own reservation.
    pub default_flow_minimum_bandwidth_weight: u32,
}

impl VmSwitch {
    /// Internal switch with no bound adapters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            switch_type: VmSwitchType::Internal,
            ..Self::default()
        }
    }

    /// Checks the settings before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] for a blank name, an external
    /// switch without adapters, adapters on a private or internal switch,
    /// or teaming with fewer than two adapters.
    pub fn validate(&self) -> Result<(), HypervError> {
        require("name", &self.name)?;
        let bound = !self.net_adapter_names.is_empty();
        match (self.switch_type, bound) {
            (VmSwitchType::External, false) => {
                return Err(HypervError::validation(
                    "net_adapter_names",
                    "an external switch needs at least one adapter",
                ));
            }
            (VmSwitchType::Private | VmSwitchType::Internal, true) => {
                return Err(HypervError::validation(
                    "switch_type",
                    "switches bound to adapters must be External",
                ));
            }
            _ => {}
        }
        if self.enable_embedded_teaming && self.net_adapter_names.len() < 2 {
            return Err(HypervError::validation(
                "enable_embedded_teaming",
                "teaming needs at least two adapters",
            ));
        }
        if self.default_flow_minimum_bandwidth_weight > 100 {
            return Err(HypervError::validation(
                "default_flow_minimum_bandwidth_weight",
                format!("{} exceeds 100", self.default_flow_minimum_bandwidth_weight),
            ));
        }
        Ok(())
    }
}

impl Presence for VmSwitch {
    fn exists(&self) -> bool {
        !self.name.is_empty()
    }
}

#[derive(Serialize)]
struct SwitchArgs<'a> {
    switch: &'a VmSwitch,
}

#[derive(Serialize)]
struct UpdateSwitchArgs<'a> {
    name: &'a str,
    switch: &'a VmSwitch,
}

/// Operations on virtual switches.
pub trait VmSwitchClient: Send + Sync {
    /// Creates the switch.
    fn create_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        switch: &'a VmSwitch,
    ) -> ClientFuture<'a, ()>;

    /// Reads a switch; an unknown name yields [`VmSwitch::default`].
    fn get_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
    ) -> ClientFuture<'a, VmSwitch>;

    /// Applies `switch` to the switch currently called `name`.
    fn update_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
        switch: &'a VmSwitch,
    ) -> ClientFuture<'a, ()>;

    /// Removes the switch if present.
    fn delete_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmSwitchClient for HypervClient<T> {
    fn create_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        switch: &'a VmSwitch,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            switch.validate()?;
            self.executor
                .run(ctx, &CREATE_VM_SWITCH, &SwitchArgs { switch })
                .await
        })
    }

    fn get_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
    ) -> ClientFuture<'a, VmSwitch> {
        Box::pin(async move {
            require("name", name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_SWITCH, &NameArgs { name })
                .await
        })
    }

    fn update_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
        switch: &'a VmSwitch,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("name", name)?;
            switch.validate()?;
            self.executor
                .run(ctx, &UPDATE_VM_SWITCH, &UpdateSwitchArgs { name, switch })
                .await
        })
    }

    fn delete_vm_switch<'a>(
        &'a self,
        ctx: &'a OperationContext,
        name: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("name", name)?;
            self.executor
                .run(ctx, &DELETE_VM_SWITCH, &NameArgs { name })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_switch_needs_adapters() {
        let switch = VmSwitch {
            switch_type: VmSwitchType::External,
            ..VmSwitch::new("wan")
        };
        assert!(switch.validate().is_err());
        let bound = VmSwitch {
            net_adapter_names: vec![String::from("Ethernet")],
            ..switch
        };
        bound.validate().expect("bound external switch is valid");
    }

    #[test]
    fn teaming_needs_two_adapters() {
        let switch = VmSwitch {
            switch_type: VmSwitchType::External,
            net_adapter_names: vec![String::from("Ethernet")],
            enable_embedded_teaming: true,
            ..VmSwitch::new("wan")
        };
        assert!(switch.validate().is_err());
    }

    #[test]
    fn lone_adapter_name_decodes_as_list() {
        let switch: VmSwitch = crate::decode::decode(
            "get_vm_switch",
            r#"{"Name":"wan","SwitchType":2,"NetAdapterNames":"Ethernet","AllowManagementOs":true}"#,
        )
        .expect("payload should decode");
        assert_eq!(switch.switch_type, VmSwitchType::External);
        assert_eq!(switch.net_adapter_names, ["Ethernet"]);
        assert!(switch.allow_management_os);
    }
}
