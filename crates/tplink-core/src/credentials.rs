//! Credentials management for TP-Link smart home devices.
//!
//! Both authenticated transports (KLAP and AES) derive their authentication
//! candidates from a [`Credentials`] pair, an optional pre-computed
//! [`CredentialsHash`], or the well-known defaults in [`DefaultCredentials`].
//!
//! # Default Credentials
//!
//! Devices may accept default credentials instead of user-specific ones:
//! - **Kasa default**: devices that have been connected to the Kasa cloud
//! - **Tapo default**: Tapo-branded devices
//! - **Blank**: devices that have never been connected to any cloud
//!
//! # Security
//!
//! Passwords and credential hashes are stored using [`SecretString`] from the
//! `secrecy` crate to prevent accidental logging or display. `Debug` renders
//! them as `[REDACTED]`.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

/// Credentials for authenticating with TP-Link devices.
///
/// # Example
///
/// ```
/// use tplink_core::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// let blank = Credentials::blank();
/// let password = creds.expose_password();
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The username (typically an email address for TP-Link cloud accounts).
    pub username: String,
    /// The password for the account (protected from accidental logging).
    password: SecretString,
}

impl Credentials {
    /// Creates new credentials with the given username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Creates credentials after validating that neither part is empty.
    ///
    /// Blank credentials are a distinct, intentional state; a user-supplied
    /// pair with an empty half is a configuration mistake.
    pub fn validated(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, Error> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidCredentials(
                "username and password must both be non-empty".into(),
            ));
        }
        Ok(Self::new(username, password))
    }

    /// Creates blank credentials (empty username and password).
    ///
    /// Blank credentials work for devices that have never been connected
    /// to the TP-Link cloud.
    pub fn blank() -> Self {
        Self {
            username: String::new(),
            password: SecretString::from(String::new()),
        }
    }

    /// Returns `true` if both username and password are empty.
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// Exposes the password for authentication purposes.
    ///
    /// Only call this when the password is actually needed to derive an auth
    /// hash or login parameter. Never log or display the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A pre-computed, opaque credentials hash.
///
/// For the KLAP transport this is base64 of the raw auth-hash digest; for the
/// AES transport it is base64 of a JSON object carrying `username` and
/// `password`/`password2`. When present it takes precedence over plaintext
/// credentials.
#[derive(Clone)]
pub struct CredentialsHash(SecretString);

impl CredentialsHash {
    /// Creates a credentials hash, rejecting the empty string.
    pub fn new(hash: impl Into<String>) -> Result<Self, Error> {
        let hash = hash.into();
        if hash.is_empty() {
            return Err(Error::InvalidCredentials(
                "credentials hash must be non-empty".into(),
            ));
        }
        Ok(Self(SecretString::from(hash)))
    }

    /// Exposes the raw base64 string for candidate construction.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl PartialEq for CredentialsHash {
    fn eq(&self, other: &Self) -> bool {
        self.0.expose_secret() == other.0.expose_secret()
    }
}

impl Eq for CredentialsHash {}

impl fmt::Debug for CredentialsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialsHash([REDACTED])")
    }
}

/// Per-device authentication configuration.
///
/// Built by merging device-level overrides over client defaults; the merged
/// view is computed once at device construction and is read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// Plaintext credentials, if configured.
    pub credentials: Option<Credentials>,
    /// Pre-computed hash; takes precedence over plaintext credentials.
    pub credentials_hash: Option<CredentialsHash>,
}

impl AuthConfig {
    /// Merges a device-level override with client defaults. Each field is
    /// taken from the device config when present, the defaults otherwise.
    pub fn merged(device: &AuthConfig, defaults: &AuthConfig) -> AuthConfig {
        AuthConfig {
            credentials: device
                .credentials
                .clone()
                .or_else(|| defaults.credentials.clone()),
            credentials_hash: device
                .credentials_hash
                .clone()
                .or_else(|| defaults.credentials_hash.clone()),
        }
    }
}

/// Default credential set used by TP-Link devices.
///
/// These are hardcoded credentials that devices may accept when they've been
/// connected to the TP-Link cloud. Both transports try these after the
/// user-supplied credentials fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultCredentials {
    /// Default Kasa credentials (for Kasa-branded devices).
    Kasa,
    /// Default Tapo credentials (for Tapo-branded devices).
    Tapo,
}

impl DefaultCredentials {
    /// Returns the default credentials for the given type.
    pub fn credentials(self) -> Credentials {
        match self {
            DefaultCredentials::Kasa => Credentials::new("kasa@tp-link.net", "kasaSetup"),
            DefaultCredentials::Tapo => Credentials::new("test@tp-link.net", "test"),
        }
    }

    /// Returns all default credential types.
    pub fn all() -> &'static [DefaultCredentials] {
        &[DefaultCredentials::Kasa, DefaultCredentials::Tapo]
    }
}
