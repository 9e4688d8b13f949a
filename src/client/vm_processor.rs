//! Virtual processor settings.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, HypervClient, Presence, VmNameArgs, require};
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

const GET_VM_PROCESSOR: ScriptTemplate = ScriptTemplate::new(
    "get_vm_processor",
    &["vm_name"],
    r#"$vmName = {{ vm_name }}
$processor = Get-VMProcessor -VMName $vmName -ErrorAction SilentlyContinue | Select-Object -First 1
if ($processor) {
    @{
        Count = $processor.Count
        Maximum = $processor.Maximum
        Reserve = $processor.Reserve
        RelativeWeight = $processor.RelativeWeight
        ExposeVirtualizationExtensions = $processor.ExposeVirtualizationExtensions
        EnableHostResourceProtection = $processor.EnableHostResourceProtection
        CompatibilityForMigrationEnabled = $processor.CompatibilityForMigrationEnabled
    } | ConvertTo-Json -Compress
} else {
    '{}'
}
"#,
);

const UPDATE_VM_PROCESSOR: ScriptTemplate = ScriptTemplate::new(
    "update_vm_processor",
    &["vm_name", "processor"],
    r#"$vmName = {{ vm_name }}
$processor = {{ processor }}
Set-VMProcessor -VMName $vmName `
    -Count $processor.Count `
    -Maximum $processor.Maximum `
    -Reserve $processor.Reserve `
    -RelativeWeight $processor.RelativeWeight `
    -ExposeVirtualizationExtensions $processor.ExposeVirtualizationExtensions `
    -EnableHostResourceProtection $processor.EnableHostResourceProtection `
    -CompatibilityForMigrationEnabled $processor.CompatibilityForMigrationEnabled
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[GET_VM_PROCESSOR, UPDATE_VM_PROCESSOR];

/// Processor settings of one machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct VmProcessor {
    /// Virtual processor count.
    pub count: u32,
    /// Percentage of host capacity the machine may use.
    pub maximum: u32,
    /// Percentage of host capacity reserved for the machine.
    pub reserve: u32,
    /// Scheduling weight relative to other machines.
    pub relative_weight: u32,
    /// Nested virtualisation support.
    pub expose_virtualization_extensions: bool,
    /// Host resource protection.
    pub enable_host_resource_protection: bool,
    /// Processor feature masking for live migration.
    pub compatibility_for_migration_enabled: bool,
}

impl VmProcessor {
    /// Checks the settings before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] for zero processors,
    /// percentages above 100, a reserve above the maximum, or a weight
    /// outside 1..=10000.
    pub fn validate(&self) -> Result<(), HypervError> {
        if self.count == 0 {
            return Err(HypervError::validation("count", "must be at least 1"));
        }
        for (field, value) in [("maximum", self.maximum), ("reserve", self.reserve)] {
            if value > 100 {
                return Err(HypervError::validation(field, format!("{value} exceeds 100")));
            }
        }
        if self.reserve > self.maximum {
            return Err(HypervError::validation("reserve", "cannot exceed maximum"));
        }
        if !(1..=10_000).contains(&self.relative_weight) {
            return Err(HypervError::validation(
                "relative_weight",
                format!("{} is outside 1..=10000", self.relative_weight),
            ));
        }
        Ok(())
    }
}

impl Presence for VmProcessor {
    fn exists(&self) -> bool {
        self.count > 0
    }
}

#[derive(Serialize)]
struct UpdateProcessorArgs<'a> {
    vm_name: &'a str,
    processor: &'a VmProcessor,
}

/// Operations on virtual processor settings.
pub trait VmProcessorClient: Send + Sync {
    /// Reads processor settings of `vm_name`.
    fn get_vm_processor<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, VmProcessor>;

    /// Applies processor settings to `vm_name`.
    fn update_vm_processor<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        processor: &'a VmProcessor,
    ) -> ClientFuture<'a, ()>;
}

impl<T: Transport> VmProcessorClient for HypervClient<T> {
    fn get_vm_processor<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
    ) -> ClientFuture<'a, VmProcessor> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            self.executor
                .run_with_result(ctx, &GET_VM_PROCESSOR, &VmNameArgs { vm_name })
                .await
        })
    }

    fn update_vm_processor<'a>(
        &'a self,
        ctx: &'a OperationContext,
        vm_name: &'a str,
        processor: &'a VmProcessor,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("vm_name", vm_name)?;
            processor.validate()?;
            self.executor
                .run(
                    ctx,
                    &UPDATE_VM_PROCESSOR,
                    &UpdateProcessorArgs { vm_name, processor },
                )
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> VmProcessor {
        VmProcessor {
            count: 2,
            maximum: 100,
            reserve: 0,
            relative_weight: 100,
            ..VmProcessor::default()
        }
    }

    #[test]
    fn accepts_host_defaults() {
        processor().validate().expect("defaults should validate");
    }

    #[test]
    fn reserve_cannot_exceed_maximum() {
        let settings = VmProcessor {
            maximum: 50,
            reserve: 60,
            ..processor()
        };
        assert!(settings.validate().is_err());
    }
}
