//! KLAP session cryptography.
//!
//! The KLAP handshake authenticates the client through a two-phase challenge
//! built on an auth hash of the account credentials:
//!
//! - v1: `md5(md5(username) + md5(password))` - 16 bytes
//! - v2: `sha256(sha1(username) + sha1(password))` - 32 bytes
//!
//! After a successful handshake, the local seed, remote seed and matched auth
//! hash are stretched into an AES-128 key, a 12-byte IV prefix, a 28-byte
//! signature prefix and the initial sequence number. Each request bumps the
//! sequence and frames the ciphertext as `sha256(sig_prefix + seq + cipher)`
//! followed by the ciphertext itself.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

use crate::{
    Credentials,
    credentials::{AuthConfig, DefaultCredentials},
    crypto::{aes_128_cbc_decrypt, aes_128_cbc_encrypt, md5, sha1, sha256},
    error::Error,
};

/// KLAP protocol revision, selecting the auth-hash and challenge scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KlapVersion {
    /// MD5-based hashing (older firmware).
    V1,
    /// SHA256-based hashing (newer firmware).
    V2,
}

/// One credential variant tried during the handshake.
///
/// Candidates are ordered; the first whose challenge matches the server hash
/// wins.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthCandidate {
    /// Human-readable candidate class, used in logs and error messages.
    pub label: &'static str,
    /// Protocol revision this hash is tried under.
    pub version: KlapVersion,
    /// Raw auth hash (16 bytes for v1, 32 for v2).
    pub auth_hash: Vec<u8>,
}

impl fmt::Debug for AuthCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCandidate")
            .field("label", &self.label)
            .field("version", &self.version)
            .field("auth_hash", &"[REDACTED]")
            .finish()
    }
}

/// KLAP v1 auth hash: `md5(md5(username) + md5(password))`.
pub fn auth_hash_v1(credentials: &Credentials) -> [u8; 16] {
    let mut seed = Vec::with_capacity(32);
    seed.extend_from_slice(&md5(credentials.username.as_bytes()));
    seed.extend_from_slice(&md5(credentials.expose_password().as_bytes()));
    md5(&seed)
}

/// KLAP v2 auth hash: `sha256(sha1(username) + sha1(password))`.
pub fn auth_hash_v2(credentials: &Credentials) -> [u8; 32] {
    let mut seed = Vec::with_capacity(40);
    seed.extend_from_slice(&sha1(credentials.username.as_bytes()));
    seed.extend_from_slice(&sha1(credentials.expose_password().as_bytes()));
    sha256(&seed)
}

/// Builds the ordered, deduplicated candidate list for a merged auth config.
///
/// Order: user hash (v2, v1), user credentials (v2, v1), Kasa defaults
/// (v2, v1), Tapo defaults (v2, v1), blank (v2, v1). Duplicate
/// `(version, hash)` pairs keep their first position.
pub fn candidates(auth: &AuthConfig) -> Result<Vec<AuthCandidate>, Error> {
    let mut list: Vec<AuthCandidate> = Vec::new();

    let mut push = |label: &'static str, version: KlapVersion, auth_hash: Vec<u8>| {
        let dup = list
            .iter()
            .any(|c| c.version == version && c.auth_hash == auth_hash);
        if !dup {
            list.push(AuthCandidate {
                label,
                version,
                auth_hash,
            });
        }
    };

    if let Some(hash) = &auth.credentials_hash {
        let raw = BASE64.decode(hash.expose()).map_err(|_| {
            Error::InvalidCredentials("credentials hash is not valid base64".into())
        })?;
        if raw.len() != 16 && raw.len() != 32 {
            return Err(Error::InvalidCredentials(format!(
                "credentials hash decodes to {} bytes, expected 16 or 32",
                raw.len()
            )));
        }
        push("user hash (v2)", KlapVersion::V2, raw.clone());
        push("user hash (v1)", KlapVersion::V1, raw);
    }

    if let Some(credentials) = &auth.credentials {
        push(
            "user (v2)",
            KlapVersion::V2,
            auth_hash_v2(credentials).to_vec(),
        );
        push(
            "user (v1)",
            KlapVersion::V1,
            auth_hash_v1(credentials).to_vec(),
        );
    }

    for default in DefaultCredentials::all() {
        let creds = default.credentials();
        let (label_v2, label_v1) = match default {
            DefaultCredentials::Kasa => ("kasa default (v2)", "kasa default (v1)"),
            DefaultCredentials::Tapo => ("tapo default (v2)", "tapo default (v1)"),
        };
        push(label_v2, KlapVersion::V2, auth_hash_v2(&creds).to_vec());
        push(label_v1, KlapVersion::V1, auth_hash_v1(&creds).to_vec());
    }

    let blank = Credentials::blank();
    push("blank (v2)", KlapVersion::V2, auth_hash_v2(&blank).to_vec());
    push("blank (v1)", KlapVersion::V1, auth_hash_v1(&blank).to_vec());

    Ok(list)
}

/// The challenge the server is expected to return from handshake 1.
///
/// - v2: `sha256(local_seed + remote_seed + auth_hash)`
/// - v1: `sha256(local_seed + auth_hash)`
pub fn handshake1_challenge(
    version: KlapVersion,
    local_seed: &[u8; 16],
    remote_seed: &[u8; 16],
    auth_hash: &[u8],
) -> [u8; 32] {
    let mut seed = Vec::with_capacity(32 + auth_hash.len());
    seed.extend_from_slice(local_seed);
    if version == KlapVersion::V2 {
        seed.extend_from_slice(remote_seed);
    }
    seed.extend_from_slice(auth_hash);
    sha256(&seed)
}

/// The client proof posted in handshake 2.
///
/// - v2: `sha256(remote_seed + local_seed + auth_hash)`
/// - v1: `sha256(remote_seed + auth_hash)`
pub fn handshake2_payload(
    version: KlapVersion,
    local_seed: &[u8; 16],
    remote_seed: &[u8; 16],
    auth_hash: &[u8],
) -> [u8; 32] {
    let mut seed = Vec::with_capacity(32 + auth_hash.len());
    seed.extend_from_slice(remote_seed);
    if version == KlapVersion::V2 {
        seed.extend_from_slice(local_seed);
    }
    seed.extend_from_slice(auth_hash);
    sha256(&seed)
}

/// Sequence-numbered AES cipher derived from a completed KLAP handshake.
///
/// The sequence is a signed 32-bit integer serialized big-endian; incrementing
/// past `0x7FFF_FFFF` wraps to `-0x8000_0000` in two's complement.
#[derive(Clone)]
pub struct KlapCipher {
    key: [u8; 16],
    iv_prefix: [u8; 12],
    sig_prefix: [u8; 28],
    seq: i32,
}

impl KlapCipher {
    /// Derives the session cipher from the handshake seeds and matched hash.
    pub fn new(local_seed: &[u8; 16], remote_seed: &[u8; 16], auth_hash: &[u8]) -> Self {
        let material = |label: &[u8]| {
            let mut seed = Vec::with_capacity(label.len() + 32 + auth_hash.len());
            seed.extend_from_slice(label);
            seed.extend_from_slice(local_seed);
            seed.extend_from_slice(remote_seed);
            seed.extend_from_slice(auth_hash);
            sha256(&seed)
        };

        let key_hash = material(b"lsk");
        let iv_hash = material(b"iv");
        let sig_hash = material(b"ldk");

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_hash[..16]);

        let mut iv_prefix = [0u8; 12];
        iv_prefix.copy_from_slice(&iv_hash[..12]);

        let mut sig_prefix = [0u8; 28];
        sig_prefix.copy_from_slice(&sig_hash[..28]);

        let mut seq_bytes = [0u8; 4];
        seq_bytes.copy_from_slice(&iv_hash[28..32]);
        let seq = i32::from_be_bytes(seq_bytes);

        Self {
            key,
            iv_prefix,
            sig_prefix,
            seq,
        }
    }

    /// Current sequence number (that of the most recent request).
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// IV for a given sequence number: the 12-byte prefix followed by the
    /// big-endian sequence.
    fn iv_for_seq(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv_prefix);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    /// Encrypts a request payload under the next sequence number.
    ///
    /// Returns the framed body (32-byte signature followed by the ciphertext)
    /// and the sequence number it was encrypted under.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> (Vec<u8>, i32) {
        let seq = self.seq.wrapping_add(1);
        self.seq = seq;

        let iv = self.iv_for_seq(seq);
        let cipher = aes_128_cbc_encrypt(&self.key, &iv, plaintext);

        let mut sig_seed = Vec::with_capacity(32 + cipher.len());
        sig_seed.extend_from_slice(&self.sig_prefix);
        sig_seed.extend_from_slice(&seq.to_be_bytes());
        sig_seed.extend_from_slice(&cipher);
        let signature = sha256(&sig_seed);

        let mut body = Vec::with_capacity(32 + cipher.len());
        body.extend_from_slice(&signature);
        body.extend_from_slice(&cipher);
        (body, seq)
    }

    /// Decrypts a framed response body under the request's sequence number.
    ///
    /// The leading 32 bytes are the device signature and are not verified.
    pub fn decrypt(&self, body: &[u8], seq: i32) -> Result<Vec<u8>, Error> {
        if body.len() < 32 {
            return Err(Error::Protocol(format!(
                "KLAP response too short: {} bytes, expected at least 32",
                body.len()
            )));
        }
        let iv = self.iv_for_seq(seq);
        aes_128_cbc_decrypt(&self.key, &iv, &body[32..])
    }
}

impl fmt::Debug for KlapCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapCipher")
            .field("key", &"[REDACTED]")
            .field("seq", &self.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> KlapCipher {
        KlapCipher::new(&[1u8; 16], &[2u8; 16], &[3u8; 32])
    }

    #[test]
    fn test_auth_hash_lengths() {
        let creds = Credentials::new("user@example.com", "secret");
        assert_eq!(auth_hash_v1(&creds).len(), 16);
        assert_eq!(auth_hash_v2(&creds).len(), 32);
        assert_ne!(
            auth_hash_v2(&creds),
            auth_hash_v2(&Credentials::new("user@example.com", "other"))
        );
    }

    #[test]
    fn test_candidate_order_and_dedup() {
        let auth = AuthConfig {
            credentials: Some(Credentials::new("user@example.com", "secret")),
            credentials_hash: None,
        };
        let list = candidates(&auth).unwrap();

        let labels: Vec<_> = list.iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec![
                "user (v2)",
                "user (v1)",
                "kasa default (v2)",
                "kasa default (v1)",
                "tapo default (v2)",
                "tapo default (v1)",
                "blank (v2)",
                "blank (v1)",
            ]
        );
        for c in &list {
            match c.version {
                KlapVersion::V1 => assert_eq!(c.auth_hash.len(), 16),
                KlapVersion::V2 => assert_eq!(c.auth_hash.len(), 32),
            }
        }
    }

    #[test]
    fn test_candidates_dedup_blank_user() {
        // A blank user pair collapses into the trailing blank candidates.
        let auth = AuthConfig {
            credentials: Some(Credentials::blank()),
            credentials_hash: None,
        };
        let list = candidates(&auth).unwrap();
        let labels: Vec<_> = list.iter().map(|c| c.label).collect();
        assert_eq!(labels[0], "user (v2)");
        assert!(!labels.contains(&"blank (v2)"));
        assert!(!labels.contains(&"blank (v1)"));
    }

    #[test]
    fn test_candidates_hash_first() {
        let auth = AuthConfig {
            credentials: Some(Credentials::new("user@example.com", "secret")),
            credentials_hash: Some(
                crate::credentials::CredentialsHash::new(BASE64.encode([7u8; 32])).unwrap(),
            ),
        };
        let list = candidates(&auth).unwrap();
        assert_eq!(list[0].label, "user hash (v2)");
        assert_eq!(list[0].version, KlapVersion::V2);
        assert_eq!(list[1].label, "user hash (v1)");
        assert_eq!(list[1].auth_hash, vec![7u8; 32]);
    }

    #[test]
    fn test_candidates_reject_bad_hash() {
        let auth = AuthConfig {
            credentials: None,
            credentials_hash: Some(
                crate::credentials::CredentialsHash::new("not-base64!!!").unwrap(),
            ),
        };
        assert!(candidates(&auth).is_err());

        let auth = AuthConfig {
            credentials: None,
            credentials_hash: Some(
                crate::credentials::CredentialsHash::new(BASE64.encode([1u8; 20])).unwrap(),
            ),
        };
        assert!(candidates(&auth).is_err());
    }

    #[test]
    fn test_challenge_versions_differ() {
        let local = [1u8; 16];
        let remote = [2u8; 16];
        let hash = [3u8; 32];
        assert_ne!(
            handshake1_challenge(KlapVersion::V1, &local, &remote, &hash),
            handshake1_challenge(KlapVersion::V2, &local, &remote, &hash)
        );
        assert_ne!(
            handshake2_payload(KlapVersion::V2, &local, &remote, &hash),
            handshake1_challenge(KlapVersion::V2, &local, &remote, &hash)
        );
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut c = cipher();
        let plain = br#"{"method":"get_device_info","params":null}"#;
        let (body, seq) = c.encrypt(plain);
        assert!(body.len() > 32);

        let decrypted = c.decrypt(&body, seq).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_sequence_increments() {
        let mut c = cipher();
        let start = c.seq();
        let (_, s1) = c.encrypt(b"a");
        let (_, s2) = c.encrypt(b"b");
        assert_eq!(s1, start.wrapping_add(1));
        assert_eq!(s2, start.wrapping_add(2));
        assert_eq!(c.seq(), s2);
    }

    #[test]
    fn test_sequence_wraps_to_int32_min() {
        let mut c = cipher();
        c.seq = i32::MAX;
        let (_, seq) = c.encrypt(b"wrap");
        assert_eq!(seq, i32::MIN);
    }

    #[test]
    fn test_iv_embeds_sequence() {
        let c = cipher();
        let iv = c.iv_for_seq(0x0102_0304);
        assert_eq!(&iv[12..], &[0x01, 0x02, 0x03, 0x04]);
        let iv = c.iv_for_seq(-1);
        assert_eq!(&iv[12..], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_frame_signature_matches() {
        let mut c = cipher();
        let (body, seq) = c.encrypt(b"payload");

        let mut seed = Vec::new();
        seed.extend_from_slice(&c.sig_prefix);
        seed.extend_from_slice(&seq.to_be_bytes());
        seed.extend_from_slice(&body[32..]);
        assert_eq!(&body[..32], &sha256(&seed));
    }

    #[test]
    fn test_decrypt_short_body_fails() {
        let c = cipher();
        assert!(matches!(
            c.decrypt(&[0u8; 31], 1),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let c = cipher();
        let debug = format!("{:?}", c);
        assert!(debug.contains("[REDACTED]"));
    }
}
