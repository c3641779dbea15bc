//! AES passthrough session cryptography.
//!
//! The AES transport (Tapo-class firmware) exchanges its session key through
//! an RSA-1024 handshake: the client sends a fresh SPKI public key, the
//! device answers with 32 bytes of key material (AES key + IV) encrypted
//! under PKCS#1 v1.5. Device padding is not always well-formed, so the
//! client decrypts with a raw RSA primitive and strips the padding by hand
//! instead of relying on a strict library unpad.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey, pkcs8::EncodePublicKey, rand_core::OsRng,
    traits::PublicKeyParts,
};

use crate::{
    crypto::{aes_128_cbc_decrypt, aes_128_cbc_encrypt},
    error::Error,
};

/// Minimum index of the PKCS#1 v1.5 zero separator: prefix (2 bytes) plus at
/// least 8 bytes of nonzero padding.
const MIN_SEPARATOR_INDEX: usize = 10;

/// Ephemeral RSA keypair for one AES handshake.
pub struct RsaKeyPair {
    public_pem: String,
    private: RsaPrivateKey,
}

impl RsaKeyPair {
    /// Generates a fresh 1024-bit keypair with an SPKI PEM public key.
    ///
    /// Uses `OsRng` from rsa's rand_core to avoid version conflicts with the
    /// rand crate used elsewhere.
    pub fn generate() -> Result<Self, Error> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, 1024)
            .map_err(|e| Error::Transport(format!("RSA key generation failed: {}", e)))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| Error::Transport(format!("PEM encoding failed: {}", e)))?;
        Ok(Self {
            public_pem,
            private,
        })
    }

    /// The SPKI PEM public key sent in the handshake request.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Raw RSA decryption with no padding handling.
    ///
    /// Returns the full key-size block, left-padded with zeros, ready for
    /// [`strip_pkcs1_v1_5`].
    pub fn decrypt_no_padding(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let c = BigUint::from_bytes_be(ciphertext);
        let m = rsa::hazmat::rsa_decrypt_and_check(&self.private, None::<&mut OsRng>, &c)
            .map_err(|e| Error::HandshakeInvalid(format!("RSA decryption failed: {}", e)))?;

        let block = m.to_bytes_be();
        let size = self.private.size();
        if block.len() > size {
            return Err(Error::HandshakeInvalid(
                "RSA plaintext longer than modulus".into(),
            ));
        }
        let mut padded = vec![0u8; size - block.len()];
        padded.extend_from_slice(&block);
        Ok(padded)
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RsaKeyPair([REDACTED])")
    }
}

/// Strips PKCS#1 v1.5 type-2 padding from a raw RSA block.
///
/// The block must start `00 02`, followed by nonzero padding, a zero
/// separator at index >= 10, then the payload.
pub fn strip_pkcs1_v1_5(block: &[u8]) -> Result<&[u8], Error> {
    if block.len() < MIN_SEPARATOR_INDEX + 1 || block[0] != 0x00 || block[1] != 0x02 {
        return Err(Error::HandshakeInvalid(
            "RSA block is not PKCS#1 v1.5 type 2".into(),
        ));
    }
    let separator = block[2..]
        .iter()
        .position(|&b| b == 0x00)
        .map(|i| i + 2)
        .ok_or_else(|| Error::HandshakeInvalid("PKCS#1 padding has no separator".into()))?;
    if separator < MIN_SEPARATOR_INDEX {
        return Err(Error::HandshakeInvalid(format!(
            "PKCS#1 separator at index {}, expected at least {}",
            separator, MIN_SEPARATOR_INDEX
        )));
    }
    Ok(&block[separator + 1..])
}

/// AES-128-CBC session cipher for the passthrough envelope.
#[derive(Clone)]
pub struct AesCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl AesCipher {
    /// Splits unpadded handshake key material into key and IV.
    ///
    /// The device must return at least 32 bytes: the first 16 are the AES
    /// key, the next 16 the IV.
    pub fn from_key_material(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < 32 {
            return Err(Error::HandshakeInvalid(format!(
                "handshake key material is {} bytes, expected at least 32",
                raw.len()
            )));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&raw[..16]);
        iv.copy_from_slice(&raw[16..32]);
        Ok(Self { key, iv })
    }

    /// Encrypts an inner JSON payload to the base64 `request` field.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        BASE64.encode(aes_128_cbc_encrypt(&self.key, &self.iv, plaintext))
    }

    /// Decrypts a base64 `response` field back to the inner payload.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, Error> {
        let cipher = BASE64
            .decode(encoded)
            .map_err(|e| Error::Protocol(format!("response is not valid base64: {}", e)))?;
        aes_128_cbc_decrypt(&self.key, &self.iv, &cipher)
    }
}

impl fmt::Debug for AesCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesCipher([REDACTED])")
    }
}
