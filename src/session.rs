//! Immutable connection parameters for one Hyper-V host.
//!
//! A [`Session`] is built once per provider configuration and shared by
//! every concurrent operation. Nothing in it changes after construction, so
//! the transport can hand out references freely.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::config::ConfigError;

/// Placeholder replaced by a per-invocation token in staging paths.
pub const RANDOM_PLACEHOLDER: &str = "%RAND%";

/// Default WinRM HTTP listener port.
pub const DEFAULT_HTTP_PORT: u16 = 5985;

/// Default staging path pattern for oversized scripts.
pub const DEFAULT_STAGING_PATTERN: &str = "C:/Temp/hyperv_%RAND%.ps1";

/// Default operation timeout when neither config nor caller supplies one.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Password wrapper that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Wraps a plaintext password.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plaintext password for wire encoding.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Account used to authenticate against the WinRM listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: Password,
}

impl Credentials {
    /// Creates credentials from a user name (optionally `DOMAIN\user`) and password.
    pub fn new(user: impl Into<String>, password: Password) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    /// Full user name as configured.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Password wrapper.
    #[must_use]
    pub const fn password(&self) -> &Password {
        &self.password
    }

    /// Splits `DOMAIN\user` into its domain and account parts.
    ///
    /// Names without a backslash have an empty domain.
    #[must_use]
    pub fn domain_and_account(&self) -> (&str, &str) {
        self.user.split_once('\\').unwrap_or(("", &self.user))
    }

    /// Removes the password from diagnostic text.
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        let secret = self.password.expose();
        if secret.is_empty() {
            return text.to_owned();
        }
        text.replace(secret, "<redacted>")
    }
}

/// Authentication scheme offered to the WinRM listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthMethod {
    /// HTTP Basic authentication.
    Basic,
    /// NTLMv2 over the `Negotiate` scheme.
    Ntlm,
}

/// Transport security settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportSecurity {
    /// Use HTTPS instead of plaintext HTTP.
    pub https: bool,
    /// Skip certificate verification.
    pub insecure: bool,
    /// Name to verify in the server certificate when dialling an address.
    pub tls_server_name: Option<String>,
    /// Additional PEM encoded CA certificates.
    pub ca_certificate: Option<Vec<u8>>,
}

/// Remote path pattern used when a script must be staged as a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagingPath(String);

impl StagingPath {
    /// Validates that the pattern contains [`RANDOM_PLACEHOLDER`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the placeholder is missing.
    pub fn new(pattern: impl Into<String>) -> Result<Self, ConfigError> {
        let value = pattern.into();
        if !value.contains(RANDOM_PLACEHOLDER) {
            return Err(ConfigError::Invalid {
                field: String::from("script_path"),
                message: format!("'{value}' must contain {RANDOM_PLACEHOLDER}"),
            });
        }
        Ok(Self(value))
    }

    /// Raw pattern as configured.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.0
    }

    /// Produces a unique Windows path for one invocation.
    #[must_use]
    pub fn instantiate(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.0.replace(RANDOM_PLACEHOLDER, &token).replace('/', "\\")
    }
}

impl Default for StagingPath {
    fn default() -> Self {
        Self(DEFAULT_STAGING_PATTERN.to_owned())
    }
}

/// Authenticated connection context for one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    host: String,
    port: u16,
    credentials: Credentials,
    auth: AuthMethod,
    security: TransportSecurity,
    staging: StagingPath,
    operation_timeout: Duration,
}

impl Session {
    /// Starts a builder with the default port, NTLM, and staging pattern.
    pub fn builder(host: impl Into<String>, credentials: Credentials) -> SessionBuilder {
        SessionBuilder {
            session: Self {
                host: host.into(),
                port: DEFAULT_HTTP_PORT,
                credentials,
                auth: AuthMethod::Ntlm,
                security: TransportSecurity::default(),
                staging: StagingPath::default(),
                operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            },
        }
    }

    /// Target host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Authentication credentials.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Authentication scheme.
    #[must_use]
    pub const fn auth(&self) -> AuthMethod {
        self.auth
    }

    /// TLS settings.
    #[must_use]
    pub const fn security(&self) -> &TransportSecurity {
        &self.security
    }

    /// Staging path pattern.
    #[must_use]
    pub const fn staging(&self) -> &StagingPath {
        &self.staging
    }

    /// Default deadline for one invocation.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// WS-Management endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let scheme = if self.security.https { "https" } else { "http" };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{scheme}://[{}]:{}/wsman", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}/wsman", self.host, self.port)
        }
    }
}

/// Builder for [`Session`].
#[derive(Clone, Debug)]
pub struct SessionBuilder {
    session: Session,
}

impl SessionBuilder {
    /// Sets the listener port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.session.port = port;
        self
    }

    /// Sets the authentication scheme.
    #[must_use]
    pub const fn auth(mut self, auth: AuthMethod) -> Self {
        self.session.auth = auth;
        self
    }

    /// Sets TLS options.
    #[must_use]
    pub fn security(mut self, security: TransportSecurity) -> Self {
        self.session.security = security;
        self
    }

    /// Sets the staging pattern.
    #[must_use]
    pub fn staging(mut self, staging: StagingPath) -> Self {
        self.session.staging = staging;
        self
    }

    /// Sets the default operation timeout.
    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.session.operation_timeout = timeout;
        self
    }

    /// Finishes the session.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the host is blank and
    /// [`ConfigError::Invalid`] when the timeout is zero.
    pub fn build(self) -> Result<Session, ConfigError> {
        if self.session.host.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("host")));
        }
        if self.session.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: String::from("timeout"),
                message: String::from("must be greater than zero"),
            });
        }
        Ok(self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn credentials() -> Credentials {
        Credentials::new("LAB\\operator", Password::new("s3cret"))
    }

    #[rstest]
    fn password_is_redacted_in_debug(credentials: Credentials) {
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[rstest]
    fn scrub_removes_password(credentials: Credentials) {
        assert_eq!(
            credentials.scrub("login failed for s3cret"),
            "login failed for <redacted>"
        );
    }

    #[rstest]
    #[case("LAB\\operator", ("LAB", "operator"))]
    #[case("operator", ("", "operator"))]
    fn splits_domain(#[case] user: &str, #[case] expected: (&str, &str)) {
        let creds = Credentials::new(user, Password::new("x"));
        assert_eq!(creds.domain_and_account(), expected);
    }

    #[rstest]
    #[case("hv01", false, "http://hv01:5985/wsman")]
    #[case("10.0.0.4", true, "https://10.0.0.4:5985/wsman")]
    #[case("fe80::1", false, "http://[fe80::1]:5985/wsman")]
    fn builds_endpoint(
        credentials: Credentials,
        #[case] host: &str,
        #[case] https: bool,
        #[case] expected: &str,
    ) {
        let session = Session::builder(host, credentials)
            .security(TransportSecurity {
                https,
                ..TransportSecurity::default()
            })
            .build()
            .expect("session should build");
        assert_eq!(session.endpoint(), expected);
    }

    #[test]
    fn staging_path_requires_placeholder() {
        let err = StagingPath::new("C:/Temp/fixed.ps1").expect_err("pattern must be rejected");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn staging_paths_are_unique_and_windows_style() {
        let staging = StagingPath::default();
        let first = staging.instantiate();
        let second = staging.instantiate();
        assert_ne!(first, second);
        assert!(first.starts_with("C:\\Temp\\hyperv_"));
        assert!(first.ends_with(".ps1"));
        assert!(!first.contains(RANDOM_PLACEHOLDER));
    }

    #[rstest]
    fn blank_host_is_rejected(credentials: Credentials) {
        let err = Session::builder("  ", credentials)
            .build()
            .expect_err("blank host must fail");
        assert_eq!(err, ConfigError::MissingField(String::from("host")));
    }
}
