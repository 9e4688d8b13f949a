//! Remote PowerShell execution for Hyper-V hosts.
//!
//! The crate renders PowerShell scripts from a fixed catalog, runs them on a
//! Windows host over WinRM, and decodes their JSON output into typed
//! results. [`HypervClient`] exposes one operation per resource kind and
//! lifecycle verb (virtual disks, ISO images, machines and their devices,
//! switches), each bounded by an [`OperationContext`] deadline.
//!
//! Failures are reported as [`HypervError`]; [`HypervError::kind`] maps them
//! onto a five-way taxonomy so callers can tell a rejected argument from an
//! unreachable host, an expired deadline, a failing script, or garbled
//! output.

pub mod client;
pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod executor;
pub mod session;
pub mod template;
pub mod test_support;
pub mod transport;

pub use client::{
    Client, ControllerSlot, Dvd, DvdClient, DvdNetwork, HypervClient, Presence, SetupError, Vhd,
    VhdClient, VhdSource, VhdSpec, Vm, VmClient, VmDvdDrive, VmDvdDriveClient, VmFirmware,
    VmFirmwareClient, VmHardDiskDrive, VmHardDiskDriveClient, VmIntegrationService,
    VmIntegrationServiceClient, VmNetworkAdapter, VmNetworkAdapterClient, VmProcessor,
    VmProcessorClient, VmStatus, VmStatusClient, VmSwitch, VmSwitchClient,
};
pub use config::{ConfigError, WinRmConfig};
pub use context::OperationContext;
pub use error::{ErrorKind, HypervError};
pub use executor::ScriptExecutor;
pub use session::{
    AuthMethod, Credentials, Password, Session, SessionBuilder, StagingPath, TransportSecurity,
};
pub use template::{ScriptCatalog, ScriptTemplate, TemplateError};
pub use transport::{ExecutionResult, ScriptInvocation, Transport, WinRmTransport};
