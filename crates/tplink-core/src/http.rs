//! HTTP request mechanics for device communication.
//!
//! TP-Link devices run a non-compliant HTTP/1.1 server that rejects requests
//! with lowercase header names. Modern HTTP clients (reqwest, hyper, ureq)
//! forcibly lowercase all headers following HTTP/2 conventions, so this
//! module speaks HTTP/1.1 with title-case headers over a raw socket.
//!
//! Ports 443 and 4433 select HTTPS; devices use self-signed certificates, so
//! TLS certificate verification is disabled.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Error;

/// Ports that select HTTPS.
const HTTPS_PORTS: &[u16] = &[443, 4433];

/// One POST request to a device endpoint.
#[derive(Debug)]
pub(crate) struct HttpRequest<'a> {
    /// Absolute path, e.g. `/app/handshake1`.
    pub path: &'a str,
    /// Raw request body.
    pub body: &'a [u8],
    /// `Content-Type` header value.
    pub content_type: &'a str,
    /// Query parameters appended as `?k1=v1&k2=v2`.
    pub query: &'a [(&'a str, String)],
    /// `Cookie` header value, if a session cookie is held.
    pub cookie: Option<&'a str>,
    /// Extra headers; an `Accept` entry here overrides the `*/*` default.
    pub headers: &'a [(&'a str, &'a str)],
}

/// An uninterpreted device response.
#[derive(Debug)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// All `Set-Cookie` values, parsed to `(name, value)`.
    pub set_cookies: Vec<(String, String)>,
}

impl HttpResponse {
    /// Looks up a cookie set by the device, by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.set_cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Cookie-aware POST client bound to one device address.
pub(crate) struct HttpClient {
    host: String,
    port: u16,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl HttpClient {
    /// Creates a client for the given address, preparing a TLS config when
    /// the port selects HTTPS.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, Error> {
        let tls = if HTTPS_PORTS.contains(&port) {
            Some(Arc::new(insecure_tls_config()))
        } else {
            None
        };
        Ok(Self {
            host: host.into(),
            port,
            tls,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends a POST and returns the raw response without interpreting the
    /// body. The deadline covers the whole exchange.
    pub async fn post(
        &self,
        request: HttpRequest<'_>,
        deadline: Duration,
    ) -> Result<HttpResponse, Error> {
        let wire = self.encode_request(&request);
        debug!(
            host = %self.host,
            port = self.port,
            path = request.path,
            body_bytes = request.body.len(),
            https = self.tls.is_some(),
            "POST"
        );

        let raw = match &self.tls {
            Some(config) => {
                let host = self.host.clone();
                let port = self.port;
                let config = config.clone();
                timeout(
                    deadline,
                    tokio::task::spawn_blocking(move || {
                        https_exchange(&host, port, &wire, config, deadline)
                    }),
                )
                .await
                .map_err(|_| Error::Timeout(format!("{}:{} request timed out", self.host, self.port)))?
                .map_err(|e| Error::Transport(format!("task join error: {}", e)))??
            }
            None => self.http_exchange(&wire, deadline).await?,
        };

        parse_response(&raw)
    }

    /// Serializes the request line, headers and body.
    fn encode_request(&self, request: &HttpRequest<'_>) -> Vec<u8> {
        let mut path = request.path.to_string();
        for (i, (key, value)) in request.query.iter().enumerate() {
            path.push(if i == 0 { '?' } else { '&' });
            path.push_str(key);
            path.push('=');
            path.push_str(value);
        }

        let mut head = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: keep-alive\r\n",
            path,
            self.host,
            self.port,
            request.content_type,
            request.body.len()
        );

        if !request.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("accept")) {
            head.push_str("Accept: */*\r\n");
        }
        for (key, value) in request.headers {
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if let Some(cookie) = request.cookie {
            head.push_str("Cookie: ");
            head.push_str(cookie);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut wire = head.into_bytes();
        wire.extend_from_slice(request.body);
        wire
    }

    /// Plain-HTTP exchange over a fresh TCP connection.
    async fn http_exchange(&self, wire: &[u8], deadline: Duration) -> Result<Vec<u8>, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        let timed_out = || Error::Timeout(format!("{} request timed out", addr));

        let mut stream = timeout(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| Error::Transport(format!("connection to {} failed: {}", addr, e)))?;

        timeout(deadline, stream.write_all(wire))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| Error::Transport(format!("write to {} failed: {}", addr, e)))?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];

        loop {
            let n = timeout(deadline, stream.read(&mut buf))
                .await
                .map_err(|_| timed_out())?
                .map_err(|e| Error::Transport(format!("read from {} failed: {}", addr, e)))?;

            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);

            if response_complete(&response) {
                break;
            }
        }

        Ok(response)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("https", &self.tls.is_some())
            .finish()
    }
}

/// HTTPS exchange using blocking rustls, driven from `spawn_blocking`.
fn https_exchange(
    host: &str,
    port: u16,
    wire: &[u8],
    config: Arc<rustls::ClientConfig>,
    deadline: Duration,
) -> Result<Vec<u8>, Error> {
    let addr = format!("{}:{}", host, port);
    let mut tcp = std::net::TcpStream::connect_timeout(
        &addr
            .parse()
            .map_err(|e| Error::Transport(format!("invalid address {}: {}", addr, e)))?,
        deadline,
    )
    .map_err(|e| map_io_error(&addr, e))?;

    tcp.set_read_timeout(Some(deadline))
        .map_err(|e| Error::Transport(format!("set read timeout failed: {}", e)))?;
    tcp.set_write_timeout(Some(deadline))
        .map_err(|e| Error::Transport(format!("set write timeout failed: {}", e)))?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Transport(format!("invalid server name: {}", host)))?;
    let mut conn = rustls::ClientConnection::new(config, server_name)
        .map_err(|e| Error::Transport(format!("TLS setup failed: {}", e)))?;
    let mut tls = rustls::Stream::new(&mut conn, &mut tcp);

    tls.write_all(wire).map_err(|e| map_io_error(&addr, e))?;
    tls.flush().map_err(|e| map_io_error(&addr, e))?;

    let mut response = Vec::with_capacity(4096);
    let mut buf = [0u8; 4096];
    loop {
        match tls.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(map_io_error(&addr, e)),
        }
        if response_complete(&response) {
            break;
        }
    }

    Ok(response)
}

fn map_io_error(addr: &str, err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            Error::Timeout(format!("{} request timed out", addr))
        }
        _ => Error::Transport(format!("{}: {}", addr, err)),
    }
}

/// True once the headers are complete and the announced body has arrived.
/// Responses without `Content-Length` are considered complete at the header
/// boundary.
fn response_complete(response: &[u8]) -> bool {
    let Some(header_end) = find_header_end(response) else {
        return false;
    };
    let headers = String::from_utf8_lossy(&response[..header_end]);
    match parse_content_length(&headers) {
        Some(expected) => response.len() >= header_end + 4 + expected,
        None => true,
    }
}

/// Splits a raw response into status, cookies and body.
fn parse_response(raw: &[u8]) -> Result<HttpResponse, Error> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no header end".into()))?;

    let headers = String::from_utf8_lossy(&raw[..header_end]);
    let status = parse_status_code(&headers)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no status code".into()))?;
    let set_cookies = parse_set_cookies(&headers);

    let body_start = header_end + 4;
    let mut body = raw[body_start..].to_vec();
    if let Some(expected) = parse_content_length(&headers) {
        body.truncate(expected);
    }

    Ok(HttpResponse {
        status,
        body,
        set_cookies,
    })
}

/// Find the position of `\r\n\r\n` (end of headers).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the HTTP status code from the status line.
fn parse_status_code(headers: &str) -> Option<u16> {
    headers
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Parse the `Content-Length` header value.
fn parse_content_length(headers: &str) -> Option<usize> {
    for line in headers.lines() {
        if line.to_lowercase().starts_with("content-length:") {
            return line.split(':').nth(1)?.trim().parse().ok();
        }
    }
    None
}

/// Parse every `Set-Cookie` header into `(name, value)`, dropping attributes
/// after the first `;`.
fn parse_set_cookies(headers: &str) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for line in headers.lines() {
        let Some(rest) = strip_header(line, "set-cookie") else {
            continue;
        };
        let pair = rest.split(';').next().unwrap_or("");
        if let Some((name, value)) = pair.split_once('=') {
            cookies.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    cookies
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

/// rustls config that accepts any certificate; devices are self-signed.
fn insecure_tls_config() -> rustls::ClientConfig {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct InsecureVerifier;

    impl ServerCertVerifier for InsecureVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
            ]
        }
    }

    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}
