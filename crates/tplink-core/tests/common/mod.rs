//! In-process mock devices for exercising the session transports end to end.
//!
//! Each mock binds an ephemeral TCP port and speaks just enough HTTP/1.1 to
//! satisfy the client: one request per connection, `Content-Length` framed
//! responses, `Set-Cookie` session handling. Handshake counters let tests
//! assert how often sessions were (re-)established.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tplink_core::Credentials;
use tplink_core::crypto::klap::{
    KlapCipher, KlapVersion, auth_hash_v2, handshake1_challenge, handshake2_payload,
};
use tplink_core::crypto::{aes::AesCipher, sha1};

/// Call counters shared between a mock device and its test.
#[derive(Default)]
pub struct Counters {
    pub handshake1: AtomicUsize,
    pub handshake2: AtomicUsize,
    /// Requests that reached `/app/request`, including rejected ones.
    pub request_attempts: AtomicUsize,
    /// Requests that were decrypted and answered.
    pub requests: AtomicUsize,
    pub aes_handshakes: AtomicUsize,
    pub logins: AtomicUsize,
}

impl Counters {
    pub fn get(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// A parsed incoming HTTP request.
struct Request {
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    fn cookie(&self) -> Option<&str> {
        self.headers.get("cookie").map(String::as_str)
    }
}

/// Reads one HTTP request from the stream.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Request> {
    let mut raw = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers",
            ));
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let target = request_line.split_whitespace().nth(1).unwrap_or("/");

    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q),
        None => (target.to_string(), ""),
    };
    let query = query_str
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        path,
        query,
        headers,
        body,
    })
}

/// Writes an HTTP response with optional `Set-Cookie` headers.
async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    cookies: &[String],
    body: &[u8],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        403 => "Forbidden",
        _ => "Error",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
        status,
        reason,
        body.len()
    );
    for cookie in cookies {
        head.push_str("Set-Cookie: ");
        head.push_str(cookie);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// KLAP mock device
// ---------------------------------------------------------------------------

type Responder = dyn Fn(&Value) -> Value + Send + Sync;

struct KlapServerState {
    /// Seeds from a handshake1 awaiting confirmation, keyed by cookie.
    pending: Option<([u8; 16], [u8; 16], String)>,
    /// Established session: cipher plus the cookie that owns it.
    session: Option<(KlapCipher, String)>,
}

/// A mock KLAP device: v2 handshake, signed AES request framing.
pub struct MockKlapDevice {
    auth_hash: [u8; 32],
    timeout_cookie: Mutex<Option<u64>>,
    reject_next_request: AtomicBool,
    responder: Box<Responder>,
    state: Mutex<KlapServerState>,
    pub counters: Counters,
    /// Decrypted request payloads, in arrival order.
    pub received: Mutex<Vec<Value>>,
}

impl MockKlapDevice {
    pub fn new(credentials: &Credentials) -> Arc<Self> {
        Self::with_responder(
            credentials,
            Box::new(|_| json!({"error_code": 0, "result": {"ok": true}})),
        )
    }

    pub fn with_responder(credentials: &Credentials, responder: Box<Responder>) -> Arc<Self> {
        Arc::new(Self {
            auth_hash: auth_hash_v2(credentials),
            timeout_cookie: Mutex::new(None),
            reject_next_request: AtomicBool::new(false),
            responder,
            state: Mutex::new(KlapServerState {
                pending: None,
                session: None,
            }),
            counters: Counters::default(),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Makes subsequent handshakes advertise a `TIMEOUT` cookie.
    pub fn set_timeout_cookie(&self, secs: u64) {
        *self.timeout_cookie.lock().unwrap() = Some(secs);
    }

    /// Makes the next `/app/request` fail with 403, once.
    pub fn reject_next_request(&self) {
        self.reject_next_request.store(true, Ordering::SeqCst);
    }

    /// Binds an ephemeral port and serves requests until dropped.
    pub async fn spawn(self: Arc<Self>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let device = self.clone();
                tokio::spawn(async move {
                    if let Ok(request) = read_request(&mut stream).await {
                        device.handle(&mut stream, request).await;
                    }
                });
            }
        });
        addr
    }

    async fn handle(&self, stream: &mut TcpStream, request: Request) {
        match request.path.as_str() {
            "/app/handshake1" => self.handshake1(stream, request).await,
            "/app/handshake2" => self.handshake2(stream, request).await,
            "/app/request" => self.request(stream, request).await,
            _ => {
                let _ = write_response(stream, 404, &[], b"").await;
            }
        }
    }

    async fn handshake1(&self, stream: &mut TcpStream, request: Request) {
        self.counters.handshake1.fetch_add(1, Ordering::SeqCst);

        if request.body.len() != 16 {
            let _ = write_response(stream, 400, &[], b"").await;
            return;
        }
        let mut local_seed = [0u8; 16];
        local_seed.copy_from_slice(&request.body);

        let mut remote_seed = [0u8; 16];
        rand::rng().fill_bytes(&mut remote_seed);

        let server_hash =
            handshake1_challenge(KlapVersion::V2, &local_seed, &remote_seed, &self.auth_hash);

        let cookie_value = random_hex(8);
        let mut cookies = vec![format!("TP_SESSIONID={};Path=/", cookie_value)];
        if let Some(secs) = *self.timeout_cookie.lock().unwrap() {
            cookies.push(format!("TIMEOUT={}", secs));
        }

        {
            let mut state = self.state.lock().unwrap();
            state.pending = Some((local_seed, remote_seed, cookie_value));
        }

        let mut body = Vec::with_capacity(48);
        body.extend_from_slice(&remote_seed);
        body.extend_from_slice(&server_hash);
        let _ = write_response(stream, 200, &cookies, &body).await;
    }

    async fn handshake2(&self, stream: &mut TcpStream, request: Request) {
        self.counters.handshake2.fetch_add(1, Ordering::SeqCst);

        let pending = { self.state.lock().unwrap().pending.take() };
        let Some((local_seed, remote_seed, cookie_value)) = pending else {
            let _ = write_response(stream, 403, &[], b"").await;
            return;
        };

        let expected_cookie = format!("TP_SESSIONID={}", cookie_value);
        let expected =
            handshake2_payload(KlapVersion::V2, &local_seed, &remote_seed, &self.auth_hash);

        if request.cookie() != Some(expected_cookie.as_str()) || request.body != expected {
            let _ = write_response(stream, 403, &[], b"").await;
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.session = Some((
                KlapCipher::new(&local_seed, &remote_seed, &self.auth_hash),
                cookie_value,
            ));
        }
        let _ = write_response(stream, 200, &[], b"").await;
    }

    async fn request(&self, stream: &mut TcpStream, request: Request) {
        self.counters.request_attempts.fetch_add(1, Ordering::SeqCst);

        if self.reject_next_request.swap(false, Ordering::SeqCst) {
            let _ = write_response(stream, 403, &[], b"").await;
            return;
        }

        let seq: i32 = match request.query.get("seq").and_then(|v| v.parse().ok()) {
            Some(seq) => seq,
            None => {
                let _ = write_response(stream, 400, &[], b"").await;
                return;
            }
        };

        let outcome: Result<Vec<u8>, u16> = {
            let mut state = self.state.lock().unwrap();
            match state.session.as_mut() {
                Some((cipher, cookie_value))
                    if request.cookie()
                        == Some(format!("TP_SESSIONID={}", cookie_value).as_str()) =>
                {
                    let plaintext = cipher
                        .decrypt(&request.body, seq)
                        .expect("mock failed to decrypt client request");
                    let parsed: Value =
                        serde_json::from_slice(&plaintext).expect("client request is not JSON");
                    self.received.lock().unwrap().push(parsed.clone());
                    self.counters.requests.fetch_add(1, Ordering::SeqCst);

                    let response = (self.responder)(&parsed);
                    let (framed, response_seq) = cipher.encrypt(response.to_string().as_bytes());
                    assert_eq!(response_seq, seq, "mock cipher out of lockstep");
                    Ok(framed)
                }
                _ => Err(403),
            }
        };

        match outcome {
            Ok(body) => {
                let _ = write_response(stream, 200, &[], &body).await;
            }
            Err(status) => {
                let _ = write_response(stream, status, &[], b"").await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AES mock device
// ---------------------------------------------------------------------------

struct AesServerState {
    cipher: Option<AesCipher>,
    cookie: Option<String>,
    token: Option<String>,
}

/// A mock AES-passthrough device accepting v2-encoded user credentials.
pub struct MockAesDevice {
    expected_username: String,
    expected_password2: String,
    state: Mutex<AesServerState>,
    pub counters: Counters,
    /// Raw HTTP bodies as received, before decryption.
    pub raw_bodies: Mutex<Vec<String>>,
    /// Decrypted inner payloads.
    pub received: Mutex<Vec<Value>>,
}

impl MockAesDevice {
    pub fn new(credentials: &Credentials) -> Arc<Self> {
        Arc::new(Self {
            expected_username: BASE64.encode(hex::encode(sha1(credentials.username.as_bytes()))),
            expected_password2: BASE64
                .encode(hex::encode(sha1(credentials.expose_password().as_bytes()))),
            state: Mutex::new(AesServerState {
                cipher: None,
                cookie: None,
                token: None,
            }),
            counters: Counters::default(),
            raw_bodies: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        })
    }

    pub async fn spawn(self: Arc<Self>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let device = self.clone();
                tokio::spawn(async move {
                    if let Ok(request) = read_request(&mut stream).await {
                        device.handle(&mut stream, request).await;
                    }
                });
            }
        });
        addr
    }

    async fn handle(&self, stream: &mut TcpStream, request: Request) {
        if request.path != "/app" {
            let _ = write_response(stream, 404, &[], b"").await;
            return;
        }

        let body_text = String::from_utf8_lossy(&request.body).to_string();
        self.raw_bodies.lock().unwrap().push(body_text.clone());

        let Ok(envelope) = serde_json::from_str::<Value>(&body_text) else {
            let _ = write_response(stream, 400, &[], b"").await;
            return;
        };

        match envelope.get("method").and_then(Value::as_str) {
            Some("handshake") => self.handshake(stream, &envelope).await,
            Some("securePassthrough") => self.passthrough(stream, &request, &envelope).await,
            _ => {
                let _ = write_response(stream, 400, &[], b"").await;
            }
        }
    }

    async fn handshake(&self, stream: &mut TcpStream, envelope: &Value) {
        use rsa::pkcs8::DecodePublicKey;
        use rsa::{Pkcs1v15Encrypt, RsaPublicKey, rand_core::OsRng};

        self.counters.aes_handshakes.fetch_add(1, Ordering::SeqCst);

        let pem = envelope
            .pointer("/params/key")
            .and_then(Value::as_str)
            .expect("handshake has no key");
        let public = RsaPublicKey::from_public_key_pem(pem).expect("client sent invalid PEM");

        let mut material = [0u8; 32];
        rand::rng().fill_bytes(&mut material);
        let mut rng = OsRng;
        let encrypted = public
            .encrypt(&mut rng, Pkcs1v15Encrypt, &material)
            .expect("RSA encrypt failed");

        let cookie_value = random_hex(8);
        {
            let mut state = self.state.lock().unwrap();
            state.cipher = Some(AesCipher::from_key_material(&material).unwrap());
            state.cookie = Some(cookie_value.clone());
            state.token = None;
        }

        let response = json!({
            "error_code": 0,
            "result": { "key": BASE64.encode(&encrypted) },
        });
        let cookies = vec![
            format!("TP_SESSIONID={};Path=/", cookie_value),
            "TIMEOUT=86400".to_string(),
        ];
        let _ = write_response(stream, 200, &cookies, response.to_string().as_bytes()).await;
    }

    async fn passthrough(&self, stream: &mut TcpStream, request: &Request, envelope: &Value) {
        let encoded = envelope
            .pointer("/params/request")
            .and_then(Value::as_str)
            .expect("passthrough has no request");

        let (cipher, cookie_value, token) = {
            let state = self.state.lock().unwrap();
            (
                state.cipher.clone(),
                state.cookie.clone(),
                state.token.clone(),
            )
        };
        let Some(cipher) = cipher else {
            let _ = write_response(stream, 403, &[], b"").await;
            return;
        };

        let expected_cookie = cookie_value.map(|v| format!("TP_SESSIONID={}", v));
        if request.cookie() != expected_cookie.as_deref() {
            let _ = write_response(stream, 403, &[], b"").await;
            return;
        }

        let plaintext = cipher.decrypt(encoded).expect("mock failed to decrypt");
        let inner: Value =
            serde_json::from_slice(&plaintext).expect("inner request is not JSON");
        self.received.lock().unwrap().push(inner.clone());

        let inner_response = match inner.get("method").and_then(Value::as_str) {
            Some("login_device") => self.login(&inner),
            Some(_) => {
                // Data requests require the login token on the query string.
                if request.query.get("token").cloned() != token {
                    json!({"error_code": 9999})
                } else {
                    self.counters.requests.fetch_add(1, Ordering::SeqCst);
                    json!({"error_code": 0, "result": {"ok": true}})
                }
            }
            None => json!({"error_code": -1003}),
        };

        let response = json!({
            "error_code": 0,
            "result": { "response": cipher.encrypt(inner_response.to_string().as_bytes()) },
        });
        let _ = write_response(stream, 200, &[], response.to_string().as_bytes()).await;
    }

    fn login(&self, inner: &Value) -> Value {
        self.counters.logins.fetch_add(1, Ordering::SeqCst);

        let username = inner.pointer("/params/username").and_then(Value::as_str);
        let password2 = inner.pointer("/params/password2").and_then(Value::as_str);

        if username == Some(self.expected_username.as_str())
            && password2 == Some(self.expected_password2.as_str())
        {
            let token = random_hex(16);
            self.state.lock().unwrap().token = Some(token.clone());
            json!({"error_code": 0, "result": {"token": token}})
        } else {
            json!({"error_code": -1501})
        }
    }
}
