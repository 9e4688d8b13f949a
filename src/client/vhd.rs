//! Virtual hard disk files.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ClientFuture, HypervClient, PathArgs, Presence, require};
use crate::client::enums::{VhdFormat, VhdType};
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

/// Disk sizes must be a whole number of 4 KiB blocks.
pub const SIZE_ALIGNMENT: u64 = 4096;

/// Sector sizes accepted by `New-VHD`; zero lets the host choose.
pub const SECTOR_SIZES: [u32; 3] = [0, 512, 4096];

const VHD_EXISTS: ScriptTemplate = ScriptTemplate::new(
    "vhd_exists",
    &["path"],
    r#"$path = {{ path | winpath }}
@{ Exists = (Test-Path -LiteralPath $path) } | ConvertTo-Json -Compress
"#,
);

const CREATE_OR_UPDATE_VHD: ScriptTemplate = ScriptTemplate::new(
    "create_or_update_vhd",
    &[
        "path",
        "source",
        "source_vm",
        "source_disk",
        "parent_path",
        "vhd_type",
        "size",
        "block_size",
        "logical_sector_size",
        "physical_sector_size",
    ],
    r#"$path = {{ path | winpath }}
$source = {{ source }}
$sourceVm = {{ source_vm }}
$sourceDisk = {{ source_disk }}
$parentPath = {{ parent_path }}
$vhdType = {{ vhd_type }}
$size = {{ size }}
$blockSize = {{ block_size }}
$logicalSectorSize = {{ logical_sector_size }}
$physicalSectorSize = {{ physical_sector_size }}

if (Test-Path -LiteralPath $path) {
    return
}

$directory = Split-Path -Path $path -Parent
if ($directory -and -not (Test-Path -LiteralPath $directory -PathType Container)) {
    New-Item -ItemType Directory -Force -Path $directory | Out-Null
}

if ($sourceVm) {
    $exportRoot = Join-Path $directory ([guid]::NewGuid().ToString())
    Export-VM -Name $sourceVm -Path $exportRoot
    $exported = Get-ChildItem -LiteralPath (Join-Path $exportRoot "$sourceVm\Virtual Hard Disks") | Select-Object -First 1
    Move-Item -LiteralPath $exported.FullName -Destination $path
    Remove-Item -LiteralPath $exportRoot -Recurse -Force
    return
}

if ($source) {
    $download = $source
    if ($source -match '^(https?|ftp)://') {
        $download = Join-Path $directory ([guid]::NewGuid().ToString() + [System.IO.Path]::GetExtension(([uri]$source).AbsolutePath))
        Invoke-WebRequest -Uri $source -OutFile $download -UseBasicParsing
    }
    if ([System.IO.Path]::GetExtension($download) -eq '.zip') {
        $extractRoot = Join-Path $directory ([guid]::NewGuid().ToString())
        Expand-Archive -LiteralPath $download -DestinationPath $extractRoot
        $image = Get-ChildItem -LiteralPath $extractRoot -Recurse -Include *.vhd, *.vhdx | Select-Object -First 1
        if (-not $image) {
            throw "archive $source contains no virtual disk"
        }
        Move-Item -LiteralPath $image.FullName -Destination $path
        Remove-Item -LiteralPath $extractRoot -Recurse -Force
        if ($download -ne $source) {
            Remove-Item -LiteralPath $download -Force
        }
    } elseif ($download -ne $source) {
        Move-Item -LiteralPath $download -Destination $path
    } else {
        Copy-Item -LiteralPath $source -Destination $path
    }
    return
}

$arguments = @{ Path = $path }
if ($parentPath) {
    $arguments.ParentPath = $parentPath
    $arguments.Differencing = $true
} else {
    if ($vhdType -eq 2) {
        $arguments.Fixed = $true
    } else {
        $arguments.Dynamic = $true
    }
    if ($null -ne $sourceDisk) {
        $arguments.SourceDisk = $sourceDisk
    } else {
        $arguments.SizeBytes = $size
    }
}
if ($blockSize -gt 0) {
    $arguments.BlockSizeBytes = $blockSize
}
if ($logicalSectorSize -gt 0) {
    $arguments.LogicalSectorSizeBytes = $logicalSectorSize
}
if ($physicalSectorSize -gt 0) {
    $arguments.PhysicalSectorSizeBytes = $physicalSectorSize
}
New-VHD @arguments | Out-Null
"#,
);

const RESIZE_VHD: ScriptTemplate = ScriptTemplate::new(
    "resize_vhd",
    &["path", "size"],
    r#"$path = {{ path | winpath }}
$size = {{ size }}
$vhd = Get-VHD -Path $path
if ($vhd.Size -ne $size) {
    Resize-VHD -Path $path -SizeBytes $size
}
"#,
);

const GET_VHD: ScriptTemplate = ScriptTemplate::new(
    "get_vhd",
    &["path"],
    r#"$path = {{ path | winpath }}
if (Test-Path -LiteralPath $path) {
    Get-VHD -Path $path |
        Select-Object Path, ParentPath, VhdType, VhdFormat, Size, FileSize, BlockSize, LogicalSectorSize, PhysicalSectorSize |
        ConvertTo-Json -Compress
} else {
    '{}'
}
"#,
);

const DELETE_VHD: ScriptTemplate = ScriptTemplate::new(
    "delete_vhd",
    &["path"],
    r#"$path = {{ path | winpath }}
$directory = Split-Path -Path $path -Parent
$baseName = [System.IO.Path]::GetFileNameWithoutExtension($path)
if (Test-Path -LiteralPath $directory -PathType Container) {
    Get-ChildItem -LiteralPath $directory |
        Where-Object { $_.BaseName.StartsWith($baseName) } |
        ForEach-Object { Remove-Item -LiteralPath $_.FullName -Force }
}
"#,
);

pub(super) const TEMPLATES: &[ScriptTemplate] = &[
    VHD_EXISTS,
    CREATE_OR_UPDATE_VHD,
    RESIZE_VHD,
    GET_VHD,
    DELETE_VHD,
];

/// Where the content of a new disk comes from.
///
/// The variants are mutually exclusive; build one from loosely typed
/// arguments with [`VhdSource::from_arguments`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum VhdSource {
    /// A blank disk of the requested size.
    #[default]
    New,
    /// Copy of a local path or download of an `http`, `https`, or `ftp` URL;
    /// `.zip` archives are unpacked.
    Source(String),
    /// First disk exported from an existing virtual machine.
    SourceVm(String),
    /// Clone of a physical disk by number.
    SourceDisk(u32),
    /// Differencing disk over a parent image.
    Parent(String),
}

impl VhdSource {
    /// Picks the single populated source; blank strings count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] when more than one is set.
    pub fn from_arguments(
        source: Option<&str>,
        source_vm: Option<&str>,
        source_disk: Option<u32>,
        parent_path: Option<&str>,
    ) -> Result<Self, HypervError> {
        fn present(value: Option<&str>) -> Option<&str> {
            value.map(str::trim).filter(|text| !text.is_empty())
        }

        let mut candidates = Vec::new();
        if let Some(url) = present(source) {
            candidates.push(("source", Self::Source(url.to_owned())));
        }
        if let Some(vm) = present(source_vm) {
            candidates.push(("source_vm", Self::SourceVm(vm.to_owned())));
        }
        if let Some(disk) = source_disk {
            candidates.push(("source_disk", Self::SourceDisk(disk)));
        }
        if let Some(parent) = present(parent_path) {
            candidates.push(("parent_path", Self::Parent(parent.to_owned())));
        }
        match candidates.len() {
            0 => Ok(Self::New),
            1 => Ok(candidates.pop().map_or(Self::New, |(_, chosen)| chosen)),
            _ => {
                let names: Vec<&str> = candidates.iter().map(|(name, _)| *name).collect();
                Err(HypervError::validation(
                    "source",
                    format!("only one of source, source_vm, source_disk, parent_path may be set; got {}", names.join(", ")),
                ))
            }
        }
    }

    /// Parent image path for differencing disks.
    #[must_use]
    pub fn parent_path(&self) -> Option<&str> {
        match self {
            Self::Parent(path) => Some(path),
            _ => None,
        }
    }
}

/// Desired state of a virtual hard disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VhdSpec {
    /// Target file path on the host.
    pub path: String,
    /// Content origin.
    pub source: VhdSource,
    /// Allocation scheme for new blank disks.
    pub vhd_type: VhdType,
    /// Virtual size in bytes; zero keeps the size of the source.
    pub size: u64,
    /// Block size in bytes; zero lets the host choose.
    pub block_size: u32,
    /// Logical sector size in bytes.
    pub logical_sector_size: u32,
    /// Physical sector size in bytes.
    pub physical_sector_size: u32,
}

impl VhdSpec {
    /// Blank dynamic disk at `path` with host defaults.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: VhdSource::New,
            vhd_type: VhdType::Dynamic,
            size: 0,
            block_size: 0,
            logical_sector_size: 0,
            physical_sector_size: 0,
        }
    }

    /// Checks the arguments before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`HypervError::Validation`] for a blank path, a size that is
    /// not a multiple of [`SIZE_ALIGNMENT`], a size combined with a parent
    /// path, a blank disk without a size, a differencing type without a
    /// parent, or an unsupported sector size.
    pub fn validate(&self) -> Result<(), HypervError> {
        require("path", &self.path)?;
        if self.size & (SIZE_ALIGNMENT - 1) != 0 {
            return Err(HypervError::validation(
                "size",
                format!("{} is not a multiple of {SIZE_ALIGNMENT}", self.size),
            ));
        }
        match &self.source {
            VhdSource::Parent(_) if self.size > 0 => {
                return Err(HypervError::validation(
                    "size",
                    "cannot be set together with parent_path; differencing disks inherit the parent size",
                ));
            }
            VhdSource::New if self.size == 0 => {
                return Err(HypervError::validation("size", "is required for a new blank disk"));
            }
            VhdSource::Parent(_) => {}
            _ if self.vhd_type == VhdType::Differencing => {
                return Err(HypervError::validation("vhd_type", "Differencing requires parent_path"));
            }
            _ => {}
        }
        for (field, value) in [
            ("logical_sector_size", self.logical_sector_size),
            ("physical_sector_size", self.physical_sector_size),
        ] {
            if !SECTOR_SIZES.contains(&value) {
                return Err(HypervError::validation(
                    field,
                    format!("{value} is not one of 0, 512, 4096"),
                ));
            }
        }
        Ok(())
    }

    /// Whether a resize must follow creation.
    #[must_use]
    pub const fn resize_required(&self) -> bool {
        self.size > 0 && !matches!(self.source, VhdSource::Parent(_))
    }
}

/// Virtual hard disk as reported by `Get-VHD`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Vhd {
    /// File path.
    pub path: String,
    /// Parent image for differencing disks.
    pub parent_path: String,
    /// Allocation scheme.
    pub vhd_type: VhdType,
    /// Container format.
    pub vhd_format: VhdFormat,
    /// Virtual size in bytes.
    pub size: u64,
    /// Bytes used on the host volume.
    pub file_size: u64,
    /// Block size in bytes.
    pub block_size: u32,
    /// Logical sector size in bytes.
    pub logical_sector_size: u32,
    /// Physical sector size in bytes.
    pub physical_sector_size: u32,
}

impl Presence for Vhd {
    fn exists(&self) -> bool {
        !self.path.is_empty()
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct VhdExists {
    exists: bool,
}

#[derive(Serialize)]
struct CreateVhdArgs<'a> {
    path: &'a str,
    source: Option<&'a str>,
    source_vm: Option<&'a str>,
    source_disk: Option<u32>,
    parent_path: Option<&'a str>,
    vhd_type: VhdType,
    size: u64,
    block_size: u32,
    logical_sector_size: u32,
    physical_sector_size: u32,
}

impl<'a> CreateVhdArgs<'a> {
    fn from_spec(spec: &'a VhdSpec) -> Self {
        let (mut source, mut source_vm, mut source_disk, mut parent_path) = (None, None, None, None);
        match &spec.source {
            VhdSource::New => {}
            VhdSource::Source(url) => source = Some(url.as_str()),
            VhdSource::SourceVm(vm) => source_vm = Some(vm.as_str()),
            VhdSource::SourceDisk(disk) => source_disk = Some(*disk),
            VhdSource::Parent(parent) => parent_path = Some(parent.as_str()),
        }
        Self {
            path: &spec.path,
            source,
            source_vm,
            source_disk,
            parent_path,
            vhd_type: spec.vhd_type,
            size: spec.size,
            block_size: spec.block_size,
            logical_sector_size: spec.logical_sector_size,
            physical_sector_size: spec.physical_sector_size,
        }
    }
}

#[derive(Serialize)]
struct ResizeArgs<'a> {
    path: &'a str,
    size: u64,
}

/// Operations on virtual hard disk files.
pub trait VhdClient: Send + Sync {
    /// Whether a file exists at `path`.
    fn vhd_exists<'a>(&'a self, ctx: &'a OperationContext, path: &'a str)
    -> ClientFuture<'a, bool>;

    /// Creates the disk unless a file already exists at its path.
    fn create_or_update_vhd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        spec: &'a VhdSpec,
    ) -> ClientFuture<'a, ()>;

    /// Grows or shrinks the disk to `size` bytes when it differs.
    fn resize_vhd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
        size: u64,
    ) -> ClientFuture<'a, ()>;

    /// Reads the disk; an absent file yields [`Vhd::default`].
    fn get_vhd<'a>(&'a self, ctx: &'a OperationContext, path: &'a str) -> ClientFuture<'a, Vhd>;

    /// Removes the disk and sibling files sharing its base name.
    fn delete_vhd<'a>(&'a self, ctx: &'a OperationContext, path: &'a str)
    -> ClientFuture<'a, ()>;

    /// Validates `spec`, creates the disk, then resizes it when a size is
    /// set and the disk has no parent.
    fn create_vhd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        spec: &'a VhdSpec,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            spec.validate()?;
            self.create_or_update_vhd(ctx, spec).await?;
            if spec.resize_required() {
                self.resize_vhd(ctx, &spec.path, spec.size).await?;
            } else {
                debug!(path = %spec.path, "skipping resize");
            }
            Ok(())
        })
    }
}

impl<T: Transport> VhdClient for HypervClient<T> {
    fn vhd_exists<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
    ) -> ClientFuture<'a, bool> {
        Box::pin(async move {
            require("path", path)?;
            let found: VhdExists = self
                .executor
                .run_with_result(ctx, &VHD_EXISTS, &PathArgs { path })
                .await?;
            Ok(found.exists)
        })
    }

    fn create_or_update_vhd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        spec: &'a VhdSpec,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            spec.validate()?;
            self.executor
                .run(ctx, &CREATE_OR_UPDATE_VHD, &CreateVhdArgs::from_spec(spec))
                .await
        })
    }

    fn resize_vhd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
        size: u64,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("path", path)?;
            if size == 0 || size & (SIZE_ALIGNMENT - 1) != 0 {
                return Err(HypervError::validation(
                    "size",
                    format!("{size} is not a positive multiple of {SIZE_ALIGNMENT}"),
                ));
            }
            self.executor
                .run(ctx, &RESIZE_VHD, &ResizeArgs { path, size })
                .await
        })
    }

    fn get_vhd<'a>(&'a self, ctx: &'a OperationContext, path: &'a str) -> ClientFuture<'a, Vhd> {
        Box::pin(async move {
            require("path", path)?;
            self.executor
                .run_with_result(ctx, &GET_VHD, &PathArgs { path })
                .await
        })
    }

    fn delete_vhd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("path", path)?;
            self.executor.run(ctx, &DELETE_VHD, &PathArgs { path }).await
        })
    }
}
