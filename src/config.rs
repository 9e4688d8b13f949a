//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::session::{
    AuthMethod, Credentials, DEFAULT_STAGING_PATTERN, Password, Session, StagingPath,
    TransportSecurity,
};

/// WinRM connection settings derived from configuration files and
/// `HYPERV_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HYPERV",
    discovery(
        app_name = "hyperv",
        env_var = "HYPERV_CONFIG_PATH",
        config_file_name = "hyperv.toml",
        dotfile_name = ".hyperv.toml",
        project_file_name = "hyperv.toml"
    )
)]
pub struct WinRmConfig {
    /// Account used for authentication, optionally `DOMAIN\user`.
    #[ortho_config(default = "Administrator".to_owned())]
    pub user: String,
    /// Password for [`Self::user`]. Required.
    pub password: String,
    /// Hyper-V host name or address.
    #[ortho_config(default = "127.0.0.1".to_owned())]
    pub host: String,
    /// WinRM listener port.
    #[ortho_config(default = 5985)]
    pub port: u16,
    /// Connect over HTTPS.
    #[ortho_config(default = false)]
    pub https: bool,
    /// Skip TLS certificate verification.
    #[ortho_config(default = false)]
    pub insecure: bool,
    /// Authenticate with NTLMv2 rather than Basic.
    #[ortho_config(default = true)]
    pub use_ntlm: bool,
    /// Server name to verify when [`Self::host`] is an address.
    pub tls_server_name: Option<String>,
    /// PEM file with extra CA certificates.
    pub cacert_path: Option<String>,
    /// Staging path pattern for oversized scripts; must contain `%RAND%`.
    #[ortho_config(default = DEFAULT_STAGING_PATTERN.to_owned())]
    pub script_path: String,
    /// Default operation timeout such as `30s` or `5m`.
    #[ortho_config(default = "30s".to_owned())]
    pub timeout: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl WinRmConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to hyperv.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hyperv")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages say how to supply a
    /// missing value through the environment or the config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty required fields and
    /// [`ConfigError::Invalid`] for malformed values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.host,
            &FieldMetadata::new("Hyper-V host", "HYPERV_HOST", "host"),
        )?;
        Self::require_field(
            &self.user,
            &FieldMetadata::new("WinRM user", "HYPERV_USER", "user"),
        )?;
        Self::require_field(
            &self.password,
            &FieldMetadata::new("WinRM password", "HYPERV_PASSWORD", "password"),
        )?;
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("port"),
                message: String::from("must be between 1 and 65535"),
            });
        }
        StagingPath::new(self.script_path.clone())?;
        let timeout = parse_duration(&self.timeout)?;
        if timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: String::from("timeout"),
                message: String::from("must be greater than zero"),
            });
        }
        if self.cacert_path.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: String::from("cacert_path"),
                message: String::from("must not be blank when set"),
            });
        }
        Ok(())
    }

    /// Validates the configuration and converts it into a [`Session`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails or the CA bundle cannot
    /// be read.
    pub fn session(&self) -> Result<Session, ConfigError> {
        self.validate()?;
        let ca_certificate = self
            .cacert_path
            .as_deref()
            .map(|path| read_file(Utf8Path::new(path)))
            .transpose()?;
        let auth = if self.use_ntlm {
            AuthMethod::Ntlm
        } else {
            AuthMethod::Basic
        };
        Session::builder(
            self.host.trim(),
            Credentials::new(self.user.trim(), Password::new(self.password.clone())),
        )
        .port(self.port)
        .auth(auth)
        .security(TransportSecurity {
            https: self.https,
            insecure: self.insecure,
            tls_server_name: self.tls_server_name.clone(),
            ca_certificate,
        })
        .staging(StagingPath::new(self.script_path.clone())?)
        .operation_timeout(parse_duration(&self.timeout)?)
        .build()
    }
}

fn read_file(path: &Utf8Path) -> Result<Vec<u8>, ConfigError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ConfigError::Invalid {
        field: String::from("cacert_path"),
        message: format!("{path} is missing a file name"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
        ConfigError::Invalid {
            field: String::from("cacert_path"),
            message: format!("{parent}: {err}"),
        }
    })?;
    dir.read(file_name).map_err(|err| ConfigError::Invalid {
        field: String::from("cacert_path"),
        message: format!("{path}: {err}"),
    })
}

/// Parses durations written as `1h30m`, `45s`, or `250ms`.
///
/// Units are `h`, `m`, `s`, `ms`, `us`, and `ns`; a bare `0` is accepted.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for empty input, missing units, unknown
/// units, or overflow.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        field: String::from("timeout"),
        message,
    };
    let text = input.trim();
    if text.is_empty() {
        return Err(invalid(String::from("duration is empty")));
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid(format!("'{text}' is missing a unit")))?;
        let (digits, tail) = rest.split_at(digits_end);
        let amount: u64 = digits
            .parse()
            .map_err(|_| invalid(format!("'{text}' is not a duration")))?;
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, remainder) = tail.split_at(unit_end);
        let part = match unit {
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(amount)),
            "ms" => Some(Duration::from_millis(amount)),
            "us" | "µs" => Some(Duration::from_micros(amount)),
            "ns" => Some(Duration::from_nanos(amount)),
            other => return Err(invalid(format!("unknown unit '{other}' in '{text}'"))),
        };
        total = part
            .and_then(|p| total.checked_add(p))
            .ok_or_else(|| invalid(format!("'{text}' overflows")))?;
        rest = remainder;
    }
    Ok(total)
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A field is present but unusable.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Configuration key.
        field: String,
        /// Reason the value was rejected.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("30s", Duration::from_secs(30))]
    #[case("5m", Duration::from_secs(300))]
    #[case("1h2m3s", Duration::from_secs(3723))]
    #[case("250ms", Duration::from_millis(250))]
    #[case(" 2m ", Duration::from_secs(120))]
    #[case("0", Duration::ZERO)]
    fn parses_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).expect("duration should parse"), expected);
    }

    #[rstest]
    #[case("")]
    #[case("30")]
    #[case("3d")]
    #[case("s")]
    #[case("1.5s")]
    fn rejects_malformed_durations(#[case] input: &str) {
        let err = parse_duration(input).expect_err("duration must be rejected");
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "timeout"));
    }
}
