//! Session transports for TP-Link smart home devices.
//!
//! This module provides the two authenticated transport implementations:
//!
//! - [`KlapTransport`]: two-phase challenge handshake with sequence-numbered
//!   signed AES framing (Kasa-class firmware)
//! - [`AesTransport`]: RSA-wrapped key exchange with base64 AES passthrough
//!   (Tapo-class firmware)
//!
//! Both establish a session lazily on first send, reuse it while unexpired,
//! and reset it on authentication errors, HTTP 403 on the data path, or
//! timeout expiry. The caller picks the engine through
//! [`DeviceConfig::transport`].

pub mod aes;
pub mod klap;

pub use aes::AesTransport;
pub use klap::KlapTransport;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{credentials::AuthConfig, error::Error};

/// Default HTTP port for both authenticated transports.
pub const DEFAULT_PORT: u16 = 80;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Guard buffer subtracted from the server-reported session timeout so the
/// client renews before the device expires the session, in seconds.
pub(crate) const SESSION_EXPIRY_GUARD_SECS: u64 = 1200;

/// Session timeout assumed when the device sends no usable `TIMEOUT` cookie,
/// in seconds.
pub(crate) const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 86_400;

/// Computes the local expiry instant from a server-reported timeout.
pub(crate) fn session_expiry(timeout_secs: u64) -> tokio::time::Instant {
    let usable = timeout_secs.saturating_sub(SESSION_EXPIRY_GUARD_SECS).max(1);
    tokio::time::Instant::now() + Duration::from_secs(usable)
}

/// Transport protocol used by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// KLAP protocol (two-phase challenge handshake).
    #[default]
    Klap,
    /// AES passthrough protocol (RSA key exchange).
    Aes,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Klap => write!(f, "KLAP"),
            TransportKind::Aes => write!(f, "AES"),
        }
    }
}

/// Configuration for connecting to a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The device hostname or IP address.
    pub host: String,
    /// Port override; defaults to 80. Ports 443 and 4433 select HTTPS.
    pub port: Option<u16>,
    /// Transport protocol to use.
    pub transport: TransportKind,
    /// Request timeout.
    pub timeout: Duration,
    /// Authentication material (already merged with client defaults).
    pub auth: AuthConfig,
}

impl DeviceConfig {
    /// Creates a new device configuration with defaults.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            transport: TransportKind::default(),
            timeout: DEFAULT_TIMEOUT,
            auth: AuthConfig::default(),
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the transport protocol.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets plaintext credentials.
    pub fn with_credentials(mut self, credentials: crate::Credentials) -> Self {
        self.auth.credentials = Some(credentials);
        self
    }

    /// Sets a pre-computed credentials hash, which takes precedence over
    /// plaintext credentials.
    pub fn with_credentials_hash(mut self, hash: crate::CredentialsHash) -> Self {
        self.auth.credentials_hash = Some(hash);
        self
    }

    /// Fills unset authentication fields from client-level defaults. Values
    /// already present on this config win.
    pub fn with_auth_defaults(mut self, defaults: &AuthConfig) -> Self {
        self.auth = AuthConfig::merged(&self.auth, defaults);
        self
    }

    /// The effective port.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// Trait for device session transports.
///
/// Implementations hold per-device session state and are not internally
/// synchronized; the SMART layer serializes access through its per-device
/// queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a payload to the device, establishing or renewing the session
    /// as needed, and returns the decrypted response plaintext.
    ///
    /// Failures classified as authentication expiry (HTTP 403 on the data
    /// path, auth-class error codes) reset the session and are retried
    /// exactly once.
    async fn send(&mut self, payload: &str) -> Result<String, Error>;

    /// Releases the session. Idempotent; the next send re-handshakes.
    async fn close(&mut self);

    /// Returns the device host.
    fn host(&self) -> &str;

    /// Returns the device port.
    fn port(&self) -> u16;
}

/// Builds the transport selected by the configuration.
pub fn create_transport(config: &DeviceConfig) -> Result<Box<dyn Transport>, Error> {
    match config.transport {
        TransportKind::Klap => Ok(Box::new(KlapTransport::new(config)?)),
        TransportKind::Aes => Ok(Box::new(AesTransport::new(config)?)),
    }
}
