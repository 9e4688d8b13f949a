//! Typed operations on Hyper-V resources.
//!
//! Each resource kind has its own capability trait (`VhdClient`,
//! `VmClient`, ...) whose methods render one catalogued script, run it
//! through the shared [`ScriptExecutor`], and decode the outcome. Arguments
//! are validated locally before anything reaches the host. Lookups of
//! absent resources succeed with a default value; [`Presence::exists`] tells
//! the two apart.
//!
//! [`HypervClient`] implements every trait and the [`Client`] super-trait,
//! so callers can depend on either the narrow capability or the whole
//! surface.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, WinRmConfig};
use crate::error::HypervError;
use crate::executor::ScriptExecutor;
use crate::session::Session;
use crate::template::{ScriptCatalog, ScriptTemplate, TemplateError};
use crate::transport::{Transport, TransportFuture, WinRmTransport};

mod dvd;
mod enums;
mod vhd;
mod vm;
mod vm_dvd_drive;
mod vm_firmware;
mod vm_hard_disk_drive;
mod vm_integration_service;
mod vm_network_adapter;
mod vm_processor;
mod vm_status;
mod vm_switch;

pub use dvd::{DEFAULT_PREFIX_LENGTH, Dvd, DvdClient, DvdNetwork};
pub use enums::{
    CheckpointType, ConsoleMode, ControllerType, IpProtocolPreference, OnOffState, PortMirroring,
    StartAction, StopAction, VhdFormat, VhdType, VmState, VmSwitchType,
};
pub use vhd::{SECTOR_SIZES, SIZE_ALIGNMENT, Vhd, VhdClient, VhdSource, VhdSpec};
pub use vm::{DEFAULT_MEMORY_STARTUP_BYTES, MEMORY_ALIGNMENT, Vm, VmClient};
pub use vm_dvd_drive::{VmDvdDrive, VmDvdDriveClient};
pub use vm_firmware::{VmFirmware, VmFirmwareClient};
pub use vm_hard_disk_drive::{VmHardDiskDrive, VmHardDiskDriveClient};
pub use vm_integration_service::{VmIntegrationService, VmIntegrationServiceClient};
pub use vm_network_adapter::{VmNetworkAdapter, VmNetworkAdapterClient};
pub use vm_processor::{VmProcessor, VmProcessorClient};
pub use vm_status::{VmStatus, VmStatusClient};
pub use vm_switch::{VmSwitch, VmSwitchClient};

/// Boxed future returned by every client operation.
pub type ClientFuture<'a, T> = TransportFuture<'a, T>;

/// Distinguishes a found resource from the default returned for an absent
/// one.
pub trait Presence {
    /// Whether the lookup found the resource.
    fn exists(&self) -> bool;
}

impl<T> Presence for Vec<T> {
    fn exists(&self) -> bool {
        !self.is_empty()
    }
}

/// Controller number and location identifying a drive within a machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ControllerSlot {
    /// Controller index.
    pub controller_number: u32,
    /// Position on the controller.
    pub controller_location: u32,
}

impl ControllerSlot {
    /// Slot at `controller_number`, `controller_location`.
    #[must_use]
    pub const fn new(controller_number: u32, controller_location: u32) -> Self {
        Self {
            controller_number,
            controller_location,
        }
    }
}

#[derive(Serialize)]
struct PathArgs<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct NameArgs<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct VmNameArgs<'a> {
    vm_name: &'a str,
}

fn require(field: &str, value: &str) -> Result<(), HypervError> {
    if value.trim().is_empty() {
        return Err(HypervError::validation(field, "must not be blank"));
    }
    Ok(())
}

/// Errors raised while assembling a [`HypervClient`].
#[derive(Debug, Error)]
pub enum SetupError {
    /// Configuration is missing or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A built-in script failed catalog checks.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// The transport could not be built.
    #[error("transport setup failed: {0}")]
    Transport(Box<HypervError>),
}

impl From<HypervError> for SetupError {
    fn from(value: HypervError) -> Self {
        Self::Transport(Box::new(value))
    }
}

/// Every built-in script, in registration order.
fn templates() -> Vec<ScriptTemplate> {
    [
        vhd::TEMPLATES,
        dvd::TEMPLATES,
        vm::TEMPLATES,
        vm_status::TEMPLATES,
        vm_processor::TEMPLATES,
        vm_firmware::TEMPLATES,
        vm_integration_service::TEMPLATES,
        vm_network_adapter::TEMPLATES,
        vm_switch::TEMPLATES,
        vm_dvd_drive::TEMPLATES,
        vm_hard_disk_drive::TEMPLATES,
    ]
    .concat()
}

/// Builds the catalog of every built-in script.
///
/// # Errors
///
/// Returns [`TemplateError`] if a built-in script fails catalog checks.
pub fn script_catalog() -> Result<ScriptCatalog, TemplateError> {
    ScriptCatalog::new(&templates())
}

/// Client for one Hyper-V host.
///
/// Cloning is cheap and clones share the transport, so one client can serve
/// many concurrent operations.
#[derive(Debug)]
pub struct HypervClient<T = WinRmTransport> {
    executor: Arc<ScriptExecutor<T>>,
}

impl<T> Clone for HypervClient<T> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
        }
    }
}

impl HypervClient<WinRmTransport> {
    /// Validates `config` and connects lazily to the configured host.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] for invalid configuration, unusable TLS
    /// settings, or a broken built-in script.
    pub fn from_config(config: &WinRmConfig) -> Result<Self, SetupError> {
        let session = config.session()?;
        Self::new(session)
    }

    /// Builds a WinRM-backed client for `session`.
    ///
    /// # Errors
    ///
    /// As [`Self::from_config`], minus configuration checks.
    pub fn new(session: Session) -> Result<Self, SetupError> {
        let timeout = session.operation_timeout();
        debug!(host = session.host(), ?timeout, "building Hyper-V client");
        let transport = WinRmTransport::new(session)?;
        Self::with_transport(transport, timeout)
    }
}

impl<T: Transport> HypervClient<T> {
    /// Builds a client over any transport; `default_timeout` bounds
    /// operations whose context sets no timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Template`] if a built-in script fails catalog
    /// checks.
    pub fn with_transport(transport: T, default_timeout: Duration) -> Result<Self, SetupError> {
        let catalog = Arc::new(script_catalog()?);
        Ok(Self {
            executor: Arc::new(ScriptExecutor::new(transport, catalog, default_timeout)),
        })
    }

    /// Shared executor, for running scripts outside the built-in set.
    #[must_use]
    pub fn executor(&self) -> &ScriptExecutor<T> {
        &self.executor
    }
}

/// Every capability a Hyper-V host offers.
pub trait Client:
    VhdClient
    + DvdClient
    + VmClient
    + VmStatusClient
    + VmProcessorClient
    + VmFirmwareClient
    + VmIntegrationServiceClient
    + VmNetworkAdapterClient
    + VmSwitchClient
    + VmDvdDriveClient
    + VmHardDiskDriveClient
{
}

impl<C> Client for C where
    C: VhdClient
        + DvdClient
        + VmClient
        + VmStatusClient
        + VmProcessorClient
        + VmFirmwareClient
        + VmIntegrationServiceClient
        + VmNetworkAdapterClient
        + VmSwitchClient
        + VmDvdDriveClient
        + VmHardDiskDriveClient
{
}
