//! Cloud-init style ISO images carrying a static network configuration.

use serde::{Deserialize, Serialize};

use super::{ClientFuture, HypervClient, PathArgs, Presence, require};
use crate::context::OperationContext;
use crate::error::HypervError;
use crate::template::ScriptTemplate;
use crate::transport::Transport;

/// Prefix length used when a [`DvdNetwork`] does not set one.
pub const DEFAULT_PREFIX_LENGTH: u8 = 16;

const CREATE_DVD: ScriptTemplate = ScriptTemplate::new(
    "create_dvd",
    &["path", "ip", "prefix_length", "gateway", "nameservers"],
    r#"$path = {{ path | winpath }}
$ip = {{ ip }}
$prefixLength = {{ prefix_length }}
$gateway = {{ gateway }}
$nameservers = {{ nameservers }}

$folder = Split-Path -Path $path -Parent
if ($folder -and -not (Test-Path -LiteralPath $folder -PathType Container)) {
    New-Item -ItemType Directory -Force -Path $folder | Out-Null
}

$staging = Join-Path ([System.IO.Path]::GetTempPath()) ([guid]::NewGuid().ToString())
New-Item -ItemType Directory -Force -Path $staging | Out-Null
try {
    $lines = @(
        'network:',
        '  version: 2',
        '  ethernets:',
        '    eth0:',
        '      dhcp4: no',
        ('      addresses: [{0}/{1}]' -f $ip, $prefixLength)
    )
    if ($gateway) {
        $lines += ('      gateway4: {0}' -f $gateway)
    }
    if ($nameservers.Count -gt 0) {
        $lines += '      nameservers:'
        $lines += ('        addresses: [{0}]' -f ($nameservers -join ', '))
    }
    [System.IO.File]::WriteAllLines((Join-Path $staging 'network_settings.yaml'), [string[]]$lines)

    if (Test-Path -LiteralPath $path) {
        Remove-Item -LiteralPath $path -Force
    }
    # oscdimg reports progress on stderr even when it succeeds.
    $ErrorActionPreference = 'Continue'
    $output = & oscdimg -n -d -m $staging $path 2>&1
    $exitCode = $LASTEXITCODE
    $ErrorActionPreference = 'Stop'
    if ($exitCode -ne 0) {
        throw ('oscdimg failed with exit code {0}: {1}' -f $exitCode, ($output -join [Environment]::NewLine))
    }
} finally {
    Remove-Item -LiteralPath $staging -Recurse -Force -ErrorAction SilentlyContinue
}
"#,
);

const GET_DVD: ScriptTemplate = ScriptTemplate::new(
    "get_dvd",
    &["path", "ip"],
    r#"$path = {{ path | winpath }}
$ip = {{ ip }}
if (Test-Path -LiteralPath $path) {
    @{ Path = $path; Ip = $ip } | ConvertTo-Json -Compress
} else {
    '{}'
}
"#,
);

const DELETE_DVD: ScriptTemplate = ScriptTemplate::new(
    "delete_dvd",
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

pub(super) const TEMPLATES: &[ScriptTemplate] = &[CREATE_DVD, GET_DVD, DELETE_DVD];

/// Static addressing written into the image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DvdNetwork {
    /// IPv4 address of the guest's first interface.
    pub ip: String,
    /// Network prefix length.
    pub prefix_length: u8,
    /// Default gateway, if any.
    pub gateway: Option<String>,
    /// DNS servers.
    pub nameservers: Vec<String>,
}

impl DvdNetwork {
    /// Address with the default prefix and no gateway or DNS servers.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            prefix_length: DEFAULT_PREFIX_LENGTH,
            gateway: None,
            nameservers: Vec::new(),
        }
    }

    /// Sets the default gateway.
    #[must_use]
    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn nameserver(mut self, server: impl Into<String>) -> Self {
        self.nameservers.push(server.into());
        self
    }

    fn validate(&self) -> Result<(), HypervError> {
        require("ip", &self.ip)?;
        if self.prefix_length == 0 || self.prefix_length > 32 {
            return Err(HypervError::validation(
                "prefix_length",
                format!("{} is outside 1..=32", self.prefix_length),
            ));
        }
        Ok(())
    }
}

/// ISO image as reported by the lookup script.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Dvd {
    /// Image path.
    pub path: String,
    /// Address the image was requested with.
    pub ip: String,
}

impl Presence for Dvd {
    fn exists(&self) -> bool {
        !self.path.is_empty()
    }
}

#[derive(Serialize)]
struct CreateDvdArgs<'a> {
    path: &'a str,
    ip: &'a str,
    prefix_length: u8,
    gateway: Option<&'a str>,
    nameservers: &'a [String],
}

#[derive(Serialize)]
struct GetDvdArgs<'a> {
    path: &'a str,
    ip: &'a str,
}

/// Operations on ISO images.
pub trait DvdClient: Send + Sync {
    /// Builds the image at `path`, creating missing folders and replacing
    /// an existing image.
    fn create_dvd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
        network: &'a DvdNetwork,
    ) -> ClientFuture<'a, ()>;

    /// Reads the image; `ip` is echoed back when it exists.
    fn get_dvd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
        ip: &'a str,
    ) -> ClientFuture<'a, Dvd>;

    /// Removes the image and sibling files sharing its base name.
    fn delete_dvd<'a>(&'a self, ctx: &'a OperationContext, path: &'a str)
    -> ClientFuture<'a, ()>;
}

impl<T: Transport> DvdClient for HypervClient<T> {
    fn create_dvd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
        network: &'a DvdNetwork,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("path", path)?;
            network.validate()?;
            let args = CreateDvdArgs {
                path,
                ip: &network.ip,
                prefix_length: network.prefix_length,
                gateway: network.gateway.as_deref(),
                nameservers: &network.nameservers,
            };
            self.executor.run(ctx, &CREATE_DVD, &args).await
        })
    }

    fn get_dvd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
        ip: &'a str,
    ) -> ClientFuture<'a, Dvd> {
        Box::pin(async move {
            require("path", path)?;
            self.executor
                .run_with_result(ctx, &GET_DVD, &GetDvdArgs { path, ip })
                .await
        })
    }

    fn delete_dvd<'a>(
        &'a self,
        ctx: &'a OperationContext,
        path: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            require("path", path)?;
            self.executor.run(ctx, &DELETE_DVD, &PathArgs { path }).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_builder_collects_settings() {
        let network = DvdNetwork::new("172.16.3.10")
            .gateway("172.16.1.254")
            .nameserver("172.16.14.27");
        assert_eq!(network.prefix_length, DEFAULT_PREFIX_LENGTH);
        assert_eq!(network.gateway.as_deref(), Some("172.16.1.254"));
        assert_eq!(network.nameservers, ["172.16.14.27"]);
        network.validate().expect("valid network");
    }

    #[test]
    fn rejects_out_of_range_prefix() {
        let network = DvdNetwork {
            prefix_length: 33,
            ..DvdNetwork::new("10.0.0.2")
        };
        assert!(network.validate().is_err());
    }

    #[test]
    fn populated_payload_means_present() {
        assert!(!Dvd::default().exists());
        let dvd = Dvd {
            path: String::from("D:\\iso\\seed.iso"),
            ip: String::from("10.0.0.2"),
        };
        assert!(dvd.exists());
    }
}
