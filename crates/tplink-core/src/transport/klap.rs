//! KLAP transport for TP-Link devices.
//!
//! KLAP is used by newer Kasa-class firmware. It operates over HTTP(S) and
//! authenticates through a two-phase challenge handshake:
//!
//! 1. **Handshake 1**: client posts 16 random bytes; the device responds
//!    with its own 16-byte seed plus a 32-byte hash proving which credential
//!    set it holds
//! 2. **Candidate matching**: the client recomputes the hash for each
//!    credential candidate (user hash, user credentials, Kasa/Tapo defaults,
//!    blank, each in v2 and v1 flavors) until one matches
//! 3. **Handshake 2**: client posts the confirmation hash for the matched
//!    candidate; the device validates it against the session cookie
//!
//! The session then carries sequence-numbered, signed AES-CBC frames on
//! `/app/request`. Sessions are established lazily on first send, reused
//! until the cookie-reported timeout (minus a renewal guard) elapses, and
//! reset on HTTP 403 with a single retry.

use std::fmt;

use async_trait::async_trait;
use rand::RngCore;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    credentials::AuthConfig,
    crypto::klap::{
        AuthCandidate, KlapCipher, KlapVersion, candidates, handshake1_challenge,
        handshake2_payload,
    },
    error::Error,
    http::{HttpClient, HttpRequest},
    transport::{DEFAULT_SESSION_TIMEOUT_SECS, DeviceConfig, Transport, session_expiry},
};

/// Session cookie name used by KLAP.
const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// Cookie carrying the server-side session timeout in seconds.
const TIMEOUT_COOKIE_NAME: &str = "TIMEOUT";

/// Live state after a successful two-phase handshake.
struct KlapSession {
    cipher: KlapCipher,
    /// Full `Cookie` header value, e.g. `TP_SESSIONID=abc`.
    cookie: Option<String>,
    expires_at: Instant,
    /// Candidate class that matched, for logs and errors.
    label: &'static str,
}

impl KlapSession {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl fmt::Debug for KlapSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapSession")
            .field("label", &self.label)
            .field("seq", &self.cipher.seq())
            .field("cookie", &"[REDACTED]")
            .finish()
    }
}

/// Transport using the KLAP protocol over HTTP(S).
pub struct KlapTransport {
    http: HttpClient,
    timeout: std::time::Duration,
    auth: AuthConfig,
    session: Option<KlapSession>,
}

impl KlapTransport {
    /// Creates a transport for the configured device. No I/O happens until
    /// the first send.
    pub fn new(config: &DeviceConfig) -> Result<Self, Error> {
        Ok(Self {
            http: HttpClient::new(config.host.clone(), config.effective_port())?,
            timeout: config.timeout,
            auth: config.auth.clone(),
            session: None,
        })
    }

    /// Establishes a session if none is live.
    async fn ensure_session(&mut self) -> Result<(), Error> {
        if let Some(session) = &self.session {
            if !session.is_expired() {
                return Ok(());
            }
            debug!(host = %self.http.host(), "KLAP session expired, renewing");
            self.session = None;
        }
        let session = self.handshake().await?;
        debug!(
            host = %self.http.host(),
            credential_type = session.label,
            "KLAP session established"
        );
        self.session = Some(session);
        Ok(())
    }

    /// Performs the full two-phase handshake.
    async fn handshake(&mut self) -> Result<KlapSession, Error> {
        let candidates = candidates(&self.auth)?;

        let mut local_seed = [0u8; 16];
        rand::rng().fill_bytes(&mut local_seed);

        debug!(
            host = %self.http.host(),
            local_seed = %hex::encode(local_seed),
            "performing KLAP handshake1"
        );

        let response = self
            .http
            .post(
                HttpRequest {
                    path: "/app/handshake1",
                    body: &local_seed,
                    content_type: "application/octet-stream",
                    query: &[],
                    cookie: None,
                    headers: &[],
                },
                self.timeout,
            )
            .await?;

        if response.status != 200 {
            return Err(Error::Http {
                status: response.status,
                context: format!("handshake1 with {}:{}", self.http.host(), self.http.port()),
            });
        }
        if response.body.len() != 48 {
            return Err(Error::HandshakeInvalid(format!(
                "handshake1 response is {} bytes, expected 48",
                response.body.len()
            )));
        }

        let mut remote_seed = [0u8; 16];
        let mut server_hash = [0u8; 32];
        remote_seed.copy_from_slice(&response.body[..16]);
        server_hash.copy_from_slice(&response.body[16..48]);

        let cookie = response
            .cookie(SESSION_COOKIE_NAME)
            .map(|v| format!("{}={}", SESSION_COOKIE_NAME, v));
        let timeout_secs = response
            .cookie(TIMEOUT_COOKIE_NAME)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);

        let matched = self
            .match_candidate(&candidates, &local_seed, &remote_seed, &server_hash)
            .ok_or_else(|| {
                let tried: Vec<_> = candidates.iter().map(|c| c.label).collect();
                Error::AuthenticationFailed(format!(
                    "{}:{} rejected every credential candidate (tried {})",
                    self.http.host(),
                    self.http.port(),
                    tried.join(", ")
                ))
            })?;

        debug!(
            host = %self.http.host(),
            credential_type = matched.label,
            remote_seed = %hex::encode(remote_seed),
            "handshake1 hash matched, performing handshake2"
        );

        let payload = handshake2_payload(
            matched.version,
            &local_seed,
            &remote_seed,
            &matched.auth_hash,
        );

        let response = self
            .http
            .post(
                HttpRequest {
                    path: "/app/handshake2",
                    body: &payload,
                    content_type: "application/octet-stream",
                    query: &[],
                    cookie: cookie.as_deref(),
                    headers: &[],
                },
                self.timeout,
            )
            .await?;

        if response.status != 200 {
            return Err(Error::AuthenticationFailed(format!(
                "{}:{} handshake2 returned status {}",
                self.http.host(),
                self.http.port(),
                response.status
            )));
        }

        Ok(KlapSession {
            cipher: KlapCipher::new(&local_seed, &remote_seed, &matched.auth_hash),
            cookie,
            expires_at: session_expiry(timeout_secs),
            label: matched.label,
        })
    }

    /// Finds the first candidate whose handshake1 challenge equals the
    /// server hash.
    fn match_candidate<'a>(
        &self,
        candidates: &'a [AuthCandidate],
        local_seed: &[u8; 16],
        remote_seed: &[u8; 16],
        server_hash: &[u8; 32],
    ) -> Option<&'a AuthCandidate> {
        candidates.iter().find(|candidate| {
            let challenge = handshake1_challenge(
                candidate.version,
                local_seed,
                remote_seed,
                &candidate.auth_hash,
            );
            let matched = &challenge == server_hash;
            debug!(
                credential_type = candidate.label,
                is_v2 = candidate.version == KlapVersion::V2,
                matched,
                "tried candidate"
            );
            matched
        })
    }

    /// Sends one framed request under the live session.
    async fn request(&mut self, payload: &str) -> Result<String, Error> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Protocol("no active KLAP session".into()))?;

        let (body, seq) = session.cipher.encrypt(payload.as_bytes());
        debug!(host = %self.http.host(), seq, "sending KLAP request");

        let query = [("seq", seq.to_string())];
        let response = self
            .http
            .post(
                HttpRequest {
                    path: "/app/request",
                    body: &body,
                    content_type: "application/octet-stream",
                    query: &query,
                    cookie: session.cookie.as_deref(),
                    headers: &[],
                },
                self.timeout,
            )
            .await?;

        if response.status != 200 {
            return Err(Error::Http {
                status: response.status,
                context: format!("request to {}:{}", self.http.host(), self.http.port()),
            });
        }

        let plaintext = session.cipher.decrypt(&response.body, seq)?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Protocol(format!("response is not valid UTF-8: {}", e)))
    }
}

#[async_trait]
impl Transport for KlapTransport {
    async fn send(&mut self, payload: &str) -> Result<String, Error> {
        self.ensure_session().await?;
        match self.request(payload).await {
            Err(e) if e.resets_session() => {
                debug!(
                    host = %self.http.host(),
                    error = %e,
                    "KLAP session rejected, re-handshaking once"
                );
                self.session = None;
                self.ensure_session().await?;
                self.request(payload).await
            }
            other => other,
        }
    }

    async fn close(&mut self) {
        self.session = None;
    }

    fn host(&self) -> &str {
        self.http.host()
    }

    fn port(&self) -> u16 {
        self.http.port()
    }
}

impl fmt::Debug for KlapTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapTransport")
            .field("host", &self.http.host())
            .field("port", &self.http.port())
            .field("session", &self.session)
            .finish()
    }
}
