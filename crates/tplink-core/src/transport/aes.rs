//! AES passthrough transport for TP-Link devices.
//!
//! Used by Tapo-class firmware. The session is established in two steps:
//!
//! 1. **Handshake**: the client generates an ephemeral RSA-1024 keypair and
//!    posts the public key to `/app`; the device replies with 32 bytes of
//!    AES key material encrypted under PKCS#1 v1.5
//! 2. **Login**: the client tries an ordered list of login candidates
//!    (explicit credentials hash, user credentials in v2 then v1 encoding,
//!    Tapo defaults) through `login_device` until the device issues a token
//!
//! Data requests travel inside a `securePassthrough` envelope carrying the
//! base64 AES-CBC ciphertext of the inner JSON. Some firmwares answer error
//! frames unencrypted, so a failed decrypt falls back to parsing the raw
//! response string as JSON.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    credentials::AuthConfig,
    crypto::{
        aes::{AesCipher, RsaKeyPair, strip_pkcs1_v1_5},
        sha1,
    },
    error::Error,
    http::{HttpClient, HttpRequest},
    transport::{DEFAULT_SESSION_TIMEOUT_SECS, DeviceConfig, Transport, session_expiry},
};

/// Session cookie name, with the fallback some firmwares use instead.
const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";
const SESSION_COOKIE_FALLBACK: &str = "SESSIONID";
const TIMEOUT_COOKIE_NAME: &str = "TIMEOUT";

/// Live state after handshake and login.
struct AesSession {
    cipher: AesCipher,
    /// Token issued by `login_device`; appended as `?token=` once present.
    token: Option<String>,
    /// Full `Cookie` header value.
    cookie: Option<String>,
    expires_at: Instant,
}

impl AesSession {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl fmt::Debug for AesSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesSession")
            .field("logged_in", &self.token.is_some())
            .field("cookie", &"[REDACTED]")
            .finish()
    }
}

/// One login variant tried by the `login_device` loop.
#[derive(Clone)]
pub(crate) struct LoginCandidate {
    pub label: &'static str,
    pub params: Value,
}

impl fmt::Debug for LoginCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCandidate")
            .field("label", &self.label)
            .field("params", &"[REDACTED]")
            .finish()
    }
}

/// Username encoding shared by both password variants:
/// `base64(sha1_hex(username))`.
fn encode_username(username: &str) -> String {
    BASE64.encode(hex::encode(sha1(username.as_bytes())))
}

/// v2 password encoding: `base64(sha1_hex(password))`, sent as `password2`.
fn encode_password_v2(password: &str) -> String {
    BASE64.encode(hex::encode(sha1(password.as_bytes())))
}

/// v1 password encoding: `base64(password)`, sent as `password`.
fn encode_password_v1(password: &str) -> String {
    BASE64.encode(password)
}

/// Builds the ordered login-candidate list for a merged auth config.
///
/// Order: explicit credentials hash, user credentials v2, user credentials
/// v1, default Tapo v2, default Tapo v1.
pub(crate) fn login_candidates(auth: &AuthConfig) -> Result<Vec<LoginCandidate>, Error> {
    let mut list = Vec::new();

    if let Some(hash) = &auth.credentials_hash {
        let raw = BASE64.decode(hash.expose()).map_err(|_| {
            Error::InvalidCredentials("credentials hash is not valid base64".into())
        })?;
        let text = String::from_utf8(raw).map_err(|_| {
            Error::InvalidCredentials("credentials hash does not decode to UTF-8".into())
        })?;
        let params: Value = serde_json::from_str(&text).map_err(|_| {
            Error::InvalidCredentials("credentials hash does not decode to JSON".into())
        })?;
        let has_username = params.get("username").is_some_and(Value::is_string);
        let has_password = params.get("password").is_some_and(Value::is_string)
            || params.get("password2").is_some_and(Value::is_string);
        if !has_username || !has_password {
            return Err(Error::InvalidCredentials(
                "credentials hash must carry username and password or password2".into(),
            ));
        }
        list.push(LoginCandidate {
            label: "user hash",
            params,
        });
    }

    if let Some(credentials) = &auth.credentials {
        let username = encode_username(&credentials.username);
        list.push(LoginCandidate {
            label: "user (v2)",
            params: json!({
                "username": username,
                "password2": encode_password_v2(credentials.expose_password()),
            }),
        });
        list.push(LoginCandidate {
            label: "user (v1)",
            params: json!({
                "username": username,
                "password": encode_password_v1(credentials.expose_password()),
            }),
        });
    }

    let tapo = crate::credentials::DefaultCredentials::Tapo.credentials();
    let username = encode_username(&tapo.username);
    list.push(LoginCandidate {
        label: "tapo default (v2)",
        params: json!({
            "username": username,
            "password2": encode_password_v2(tapo.expose_password()),
        }),
    });
    list.push(LoginCandidate {
        label: "tapo default (v1)",
        params: json!({
            "username": username,
            "password": encode_password_v1(tapo.expose_password()),
        }),
    });

    Ok(list)
}

/// Milliseconds since the Unix epoch, for `request_time_milis`.
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Transport using the AES passthrough protocol over HTTP(S).
pub struct AesTransport {
    http: HttpClient,
    timeout: std::time::Duration,
    auth: AuthConfig,
    session: Option<AesSession>,
}

impl AesTransport {
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

    /// Establishes the session (handshake plus login) if none is live.
    async fn ensure_session(&mut self) -> Result<(), Error> {
        if let Some(session) = &self.session {
            if session.token.is_some() && !session.is_expired() {
                return Ok(());
            }
            debug!(host = %self.http.host(), "AES session expired, renewing");
            self.session = None;
        }
        self.handshake_and_login().await
    }

    /// Full session establishment: handshake, then the login-candidate loop.
    ///
    /// An auth-class rejection resets the session and moves on to the next
    /// candidate with a fresh handshake; any other failure is surfaced
    /// immediately.
    async fn handshake_and_login(&mut self) -> Result<(), Error> {
        let candidates = login_candidates(&self.auth)?;
        let mut tried: Vec<&'static str> = Vec::new();

        for candidate in &candidates {
            if self.session.is_none() {
                self.session = Some(self.handshake().await?);
            }

            match self.try_login(candidate).await {
                Ok(token) => {
                    debug!(
                        host = %self.http.host(),
                        credential_type = candidate.label,
                        "AES login succeeded"
                    );
                    if let Some(session) = self.session.as_mut() {
                        session.token = Some(token);
                    }
                    return Ok(());
                }
                Err(e) if e.resets_session() => {
                    debug!(
                        host = %self.http.host(),
                        credential_type = candidate.label,
                        error = %e,
                        "login candidate rejected"
                    );
                    tried.push(candidate.label);
                    self.session = None;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::AuthenticationFailed(format!(
            "{}:{} rejected every login candidate (tried {})",
            self.http.host(),
            self.http.port(),
            tried.join(", ")
        )))
    }

    /// RSA key exchange on `/app`.
    async fn handshake(&self) -> Result<AesSession, Error> {
        debug!(host = %self.http.host(), "performing AES handshake");

        let keypair = RsaKeyPair::generate()?;
        let request = json!({
            "method": "handshake",
            "params": { "key": keypair.public_pem() },
        });
        let body = serde_json::to_vec(&request)
            .map_err(|e| Error::Protocol(format!("handshake encode failed: {}", e)))?;

        let response = self
            .http
            .post(
                HttpRequest {
                    path: "/app",
                    body: &body,
                    content_type: "application/json",
                    query: &[],
                    cookie: None,
                    headers: &[("requestByApp", "true"), ("Accept", "application/json")],
                },
                self.timeout,
            )
            .await?;

        if response.status != 200 {
            return Err(Error::Http {
                status: response.status,
                context: format!("handshake with {}:{}", self.http.host(), self.http.port()),
            });
        }

        let envelope: Value = serde_json::from_slice(&response.body)
            .map_err(|e| Error::HandshakeInvalid(format!("handshake response: {}", e)))?;
        let error_code = envelope.get("error_code").and_then(Value::as_i64);
        if error_code != Some(0) {
            return Err(Error::HandshakeInvalid(format!(
                "handshake returned error_code {:?}",
                error_code
            )));
        }

        let key = envelope
            .pointer("/result/key")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::HandshakeInvalid("handshake response has no key".into()))?;
        let encrypted = BASE64
            .decode(key)
            .map_err(|_| Error::HandshakeInvalid("handshake key is not valid base64".into()))?;

        let block = keypair.decrypt_no_padding(&encrypted)?;
        let material = strip_pkcs1_v1_5(&block)?;
        let cipher = AesCipher::from_key_material(material)?;

        let cookie = response
            .cookie(SESSION_COOKIE_NAME)
            .map(|v| format!("{}={}", SESSION_COOKIE_NAME, v))
            .or_else(|| {
                response
                    .cookie(SESSION_COOKIE_FALLBACK)
                    .map(|v| format!("{}={}", SESSION_COOKIE_FALLBACK, v))
            });
        let timeout_secs = response
            .cookie(TIMEOUT_COOKIE_NAME)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);

        Ok(AesSession {
            cipher,
            token: None,
            cookie,
            expires_at: session_expiry(timeout_secs),
        })
    }

    /// One `login_device` attempt under the current handshake.
    async fn try_login(&self, candidate: &LoginCandidate) -> Result<String, Error> {
        let inner = json!({
            "method": "login_device",
            "params": candidate.params.clone(),
            "request_time_milis": now_millis(),
        });
        let response = self.passthrough(&inner).await?;

        // Auth-class codes already surfaced inside passthrough; any other
        // non-zero code is a hard login failure.
        let code = response.get("error_code").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            return Err(Error::Smart {
                code,
                method: "login_device".into(),
                request_json: redact_login_params(&inner).to_string(),
                response_json: response.to_string(),
            });
        }

        response
            .pointer("/result/token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("login response has no token".into()))
    }

    /// Sends an inner JSON payload through `securePassthrough` and returns
    /// the decrypted, parsed inner response.
    ///
    /// Auth-class inner error codes surface as `Error::Smart` so the caller
    /// can reset the session; other non-zero inner codes are returned in the
    /// parsed value for the envelope layer to interpret.
    async fn passthrough(&self, inner: &Value) -> Result<Value, Error> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Protocol("no active AES session".into()))?;

        let method = inner
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("securePassthrough")
            .to_string();
        let plaintext = serde_json::to_string(inner)
            .map_err(|e| Error::Protocol(format!("request encode failed: {}", e)))?;
        let encrypted = session.cipher.encrypt(plaintext.as_bytes());
        let envelope = json!({
            "method": "securePassthrough",
            "params": { "request": encrypted },
        });
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| Error::Protocol(format!("request encode failed: {}", e)))?;

        let query: Vec<(&str, String)> = match &session.token {
            Some(token) => vec![("token", token.clone())],
            None => Vec::new(),
        };

        let response = self
            .http
            .post(
                HttpRequest {
                    path: "/app",
                    body: &body,
                    content_type: "application/json",
                    query: &query,
                    cookie: session.cookie.as_deref(),
                    headers: &[("requestByApp", "true"), ("Accept", "application/json")],
                },
                self.timeout,
            )
            .await?;

        if response.status != 200 {
            return Err(Error::Http {
                status: response.status,
                context: format!(
                    "passthrough to {}:{}",
                    self.http.host(),
                    self.http.port()
                ),
            });
        }

        let outer: Value = serde_json::from_slice(&response.body)
            .map_err(|e| Error::Protocol(format!("passthrough response: {}", e)))?;
        let outer_code = outer.get("error_code").and_then(Value::as_i64).unwrap_or(0);
        if outer_code != 0 {
            return Err(Error::Smart {
                code: outer_code,
                method,
                request_json: redact_login_params(inner).to_string(),
                response_json: outer.to_string(),
            });
        }

        let encoded = outer
            .pointer("/result/response")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("passthrough response has no payload".into()))?;

        let parsed = self.decode_inner(session, encoded)?;

        let inner_code = parsed.get("error_code").and_then(Value::as_i64).unwrap_or(0);
        if inner_code != 0 && crate::error::AES_AUTH_ERRORS.contains(&inner_code) {
            return Err(Error::Smart {
                code: inner_code,
                method,
                request_json: redact_login_params(inner).to_string(),
                response_json: parsed.to_string(),
            });
        }

        Ok(parsed)
    }

    /// Decrypts and parses the inner response, tolerating mixed-mode error
    /// frames: some firmwares skip encryption on errors, so a failed decrypt
    /// or parse falls back to treating the raw string as JSON.
    fn decode_inner(&self, session: &AesSession, encoded: &str) -> Result<Value, Error> {
        let decrypted = session
            .cipher
            .decrypt(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| serde_json::from_str::<Value>(&text).ok());

        match decrypted {
            Some(value) => Ok(value),
            None => serde_json::from_str(encoded).map_err(|_| {
                Error::Protocol("passthrough payload is neither ciphertext nor JSON".into())
            }),
        }
    }
}

/// Strips password material from a request envelope before it lands in an
/// error. Usernames stay; `password`/`password2` render as `[REDACTED]`.
fn redact_login_params(inner: &Value) -> Value {
    let mut copy = inner.clone();
    if let Some(params) = copy.get_mut("params").and_then(Value::as_object_mut) {
        for field in ["password", "password2"] {
            if let Some(value) = params.get_mut(field) {
                *value = Value::String("[REDACTED]".into());
            }
        }
    }
    copy
}

#[async_trait]
impl Transport for AesTransport {
    async fn send(&mut self, payload: &str) -> Result<String, Error> {
        let inner: Value = serde_json::from_str(payload)
            .map_err(|e| Error::Protocol(format!("payload is not valid JSON: {}", e)))?;

        self.ensure_session().await?;
        let result = match self.passthrough(&inner).await {
            Err(e) if e.resets_session() => {
                debug!(
                    host = %self.http.host(),
                    error = %e,
                    "AES session rejected, re-establishing once"
                );
                self.session = None;
                self.ensure_session().await?;
                self.passthrough(&inner).await
            }
            other => other,
        }?;

        Ok(result.to_string())
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

impl fmt::Debug for AesTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesTransport")
            .field("host", &self.http.host())
            .field("port", &self.http.port())
            .field("session", &self.session)
            .finish()
    }
}
