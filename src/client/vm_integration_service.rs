//! Guest integration services such as heartbeat and time synchronisation.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, HypervClient, VmNameArgs, require};
use crate::context::OperationContext;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

const GET_VM_INTEGRATION_SERVICES: ScriptTemplate = ScriptTemplate::new(
    "get_vm_integration_services",
    &["vm_name"],
    r#"$vmName = {{ vm_name }}
$services = @(Get-VMIntegrationService -VMName $vmName -ErrorAction SilentlyContinue |
    ForEach-Object { @{ Name = $_.Name; Enabled = $_.Enabled } })
ConvertTo-Json -InputObject $services -Compress
"#,
);

const UPDATE_VM_INTEGRATION_SERVICES: ScriptTemplate = ScriptTemplate::new(
    "update_vm_integration_services",
    &["vm_name", "services"],
    r#"$vmName = {{ vm_name }}
$services = {{ services }}
foreach ($service in $services) {
    $current = Get-VMIntegrationService -VMName $vmName -Name $service.Name
    if ($service.Enabled -and -not $current.Enabled) {
        Enable-VMIntegrationService -VMName $vmName -Name $service.Name
    } elseif (-not $service.Enabled -and $current.Enabled) {
        Disable-VMIntegrationService -VMName $vmName -Name $service.Name
    }
}
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] =
    &[GET_VM_INTEGRATION_SERVICES, UPDATE_VM_INTEGRATION_SERVICES];

/// One integration service and whether it is offered to the guest.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct VmIntegrationService {
    /// Display name, for example `Guest Service Interface`.
    pub name: String,
    /// Whether the service is enabled.
    pub enabled: bool,
}

impl VmIntegrationService {
    /// Service with the given name and state.
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
        }
    }
}

#[derive(Serialize)]
struct UpdateServicesArgs<'a> {
    vm_name: &'a str,
    services: &'a [VmIntegrationService],
}

/// Operations on integration services.
pub trait VmIntegrationServiceClient: Send + Sync {
    /// Lists the services of `vm_name`.
    fn get_vm_integration_services<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmIntegrationService>>;

    /// Enables or disables each named service; unnamed services are left
    /// untouched.
    fn update_vm_integration_services<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        services: &'a [VmIntegrationService],
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmIntegrationServiceClient for HypervClient<T> {
    fn get_vm_integration_services<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, Vec<VmIntegrationService>> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_INTEGRATION_SERVICES, &VmNameArgs { vm_name })
                .await
        })
    }

    fn update_vm_integration_services<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        services: &'a [VmIntegrationService],
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            for service in services {
                require("services.name", &service.name)?;
            }
            self.executor
                .run(
                    ctx,
                    &UPDATE_VM_INTEGRATION_SERVICES,
                    &UpdateServicesArgs { vm_name, services },
                )
                .await
        })
    }
}
