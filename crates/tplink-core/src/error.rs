//! Error types for tplink-core.
//!
//! This module defines the error taxonomy surfaced by the transports and the
//! SMART request layer. Messages include the device `host:port` where known
//! and never contain plaintext credentials or key material.

use thiserror::Error;

/// Error codes that classify as authentication failures in AES
/// `securePassthrough` responses. Any of these resets the session.
pub const AES_AUTH_ERRORS: &[i64] = &[-1501, 1111, -1005, 1100, 1003, -40412];

/// Error type for tplink-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Supplied credentials or credentials hash failed validation.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Every authentication candidate was tried and rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Malformed handshake response (wrong size, bad PKCS#1 padding,
    /// missing key material).
    #[error("handshake invalid: {0}")]
    HandshakeInvalid(String),

    /// Wire-format violation: bad JSON, missing fields, short ciphertext.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HTTP deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Non-200 HTTP status outside the recoverable cases.
    #[error("HTTP error {status}: {context}")]
    Http {
        /// The HTTP status code returned by the device.
        status: u16,
        /// Where in the exchange the status was observed.
        context: String,
    },

    /// Non-zero `error_code` in a SMART envelope, including per-entry
    /// failures inside a `multipleRequest` batch.
    #[error("SMART error {code} for method {method}")]
    Smart {
        /// Device error code.
        code: i64,
        /// The SMART method that failed.
        method: String,
        /// The request envelope as sent (already credential-free).
        request_json: String,
        /// The raw response envelope.
        response_json: String,
    },

    /// Socket or TLS level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Returns true if the error forces a session reset on the data path:
    /// HTTP 403 or an auth-class SMART error code.
    pub(crate) fn resets_session(&self) -> bool {
        match self {
            Error::Http { status: 403, .. } => true,
            Error::Smart { code, .. } => AES_AUTH_ERRORS.contains(code),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
