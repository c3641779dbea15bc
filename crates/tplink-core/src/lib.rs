//! Core library for the authenticated transports of TP-Link smart home
//! devices.
//!
//! Newer TP-Link firmware replaces the old unauthenticated port-9999
//! protocol with two session-oriented HTTP transports:
//!
//! - **KLAP** (Kasa-class): a two-phase challenge handshake followed by
//!   sequence-numbered, signed AES-128-CBC frames
//! - **AES passthrough** (Tapo-class): an RSA-1024 key exchange, a
//!   `login_device` token, and base64 AES-CBC `securePassthrough` envelopes
//!
//! On top of either transport sits the SMART request layer: single-method
//! calls, `multipleRequest` batching, and `control_child` routing for child
//! devices, all serialized per device so one logical session is shared by
//! concurrent callers.
//!
//! # Example
//!
//! ```no_run
//! use tplink_core::{Credentials, DeviceConfig, SmartDevice, TransportKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tplink_core::Error> {
//!     let config = DeviceConfig::new("192.168.1.100")
//!         .with_transport(TransportKind::Klap)
//!         .with_credentials(Credentials::new("user@example.com", "password"));
//!
//!     let device = SmartDevice::new(&config)?;
//!     let info = device.send_smart_command("get_device_info", None, None).await?;
//!     println!("{}", info);
//!
//!     device.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Session lifecycle
//!
//! Sessions are created lazily on the first send and reused until the
//! device-reported timeout (minus a renewal guard) elapses. An HTTP 403 on
//! the data path or an auth-class error code resets the session; the send
//! is retried exactly once after a fresh handshake. `close()` resets the
//! session state and is idempotent.

pub mod credentials;
pub mod crypto;
pub mod error;
pub(crate) mod http;
pub mod smart;
pub mod transport;

pub use credentials::{AuthConfig, Credentials, CredentialsHash, DefaultCredentials};
pub use error::Error;
pub use smart::{SmartDevice, SmartRequest};
pub use transport::{
    AesTransport, DEFAULT_PORT, DEFAULT_TIMEOUT, DeviceConfig, KlapTransport, Transport,
    TransportKind, create_transport,
};

/// The version of the tplink-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
