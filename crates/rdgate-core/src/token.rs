//! Encrypted connection tokens.
//!
//! Token format: `base64( JSON {"iv": base64(nonce), "value": base64(ciphertext || tag)} )`.
//! The plaintext is a JSON [`ConnectionDescriptor`]. The process holds one
//! key and one AEAD cipher, both fixed at startup.

use crate::error::{GatewayError, GatewayResult};
use crate::settings::ConnectionDescriptor;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported token ciphers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Cipher {
    Aes128Gcm,
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Cipher {
    fn algorithm(self) -> &'static aead::Algorithm {
        match self {
            Cipher::Aes128Gcm => &aead::AES_128_GCM,
            Cipher::Aes256Gcm => &aead::AES_256_GCM,
            Cipher::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    /// Required key length in bytes.
    pub fn key_len(self) -> usize {
        self.algorithm().key_len()
    }

    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes128Gcm => "aes-128-gcm",
            Cipher::Aes256Gcm => "aes-256-gcm",
            Cipher::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cipher {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Cipher::Aes128Gcm),
            "aes-256-gcm" => Ok(Cipher::Aes256Gcm),
            "chacha20-poly1305" => Ok(Cipher::ChaCha20Poly1305),
            other => Err(GatewayError::Config(format!("unsupported cipher: {other}"))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    iv: String,
    value: String,
}

/// Decrypts (and, for operators and tests, issues) connection tokens.
pub struct TokenCodec {
    cipher: Cipher,
    key: LessSafeKey,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Build a codec from raw key bytes. The key length must match the cipher.
    pub fn new(cipher: Cipher, key: &[u8]) -> GatewayResult<Self> {
        if key.len() != cipher.key_len() {
            return Err(GatewayError::Config(format!(
                "{cipher} needs a {}-byte key, got {} bytes",
                cipher.key_len(),
                key.len()
            )));
        }
        let unbound = UnboundKey::new(cipher.algorithm(), key)
            .map_err(|_| GatewayError::Config("invalid key".into()))?;
        Ok(Self {
            cipher,
            key: LessSafeKey::new(unbound),
        })
    }

    /// Build a codec from a hex-encoded key (surrounding whitespace ignored).
    pub fn from_hex(cipher: Cipher, key_hex: &str) -> GatewayResult<Self> {
        let key = hex::decode(key_hex.trim())
            .map_err(|e| GatewayError::Config(format!("key is not valid hex: {e}")))?;
        Self::new(cipher, &key)
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// Decrypt a token into its connection descriptor.
    pub fn decrypt(&self, token: &str) -> GatewayResult<ConnectionDescriptor> {
        let outer = decode_base64(token)?;
        let envelope: TokenEnvelope = serde_json::from_slice(&outer)
            .map_err(|e| GatewayError::TokenDecryption(format!("invalid token envelope: {e}")))?;

        let iv = decode_base64(&envelope.iv)?;
        let nonce = Nonce::try_assume_unique_for_key(&iv).map_err(|_| {
            GatewayError::TokenDecryption(format!(
                "IV must be {NONCE_LEN} bytes, got {}",
                iv.len()
            ))
        })?;

        let mut in_out = decode_base64(&envelope.value)?;
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| GatewayError::TokenDecryption("authentication failed".into()))?;

        serde_json::from_slice(plaintext)
            .map_err(|e| GatewayError::TokenDecryption(format!("invalid descriptor: {e}")))
    }

    /// Encrypt a descriptor into a URL-safe token under a fresh random nonce.
    pub fn encrypt(&self, descriptor: &ConnectionDescriptor) -> GatewayResult<String> {
        let plaintext = serde_json::to_vec(descriptor)
            .map_err(|e| GatewayError::Other(format!("descriptor encode failed: {e}")))?;
        self.seal(plaintext)
    }

    fn seal(&self, mut in_out: Vec<u8>) -> GatewayResult<String> {
        let mut iv = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut iv)
            .map_err(|_| GatewayError::Other("RNG failure".into()))?;

        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| GatewayError::Other("encryption failed".into()))?;

        let envelope = TokenEnvelope {
            iv: STANDARD.encode(iv),
            value: STANDARD.encode(&in_out),
        };
        let json = serde_json::to_vec(&envelope)
            .map_err(|e| GatewayError::Other(format!("envelope encode failed: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }
}

/// Decode base64 in either alphabet, padded or not.
///
/// A `+` that went through query-string decoding arrives as a space, so
/// spaces are read back as `+`.
fn decode_base64(input: &str) -> GatewayResult<Vec<u8>> {
    let input = input.trim().replace(' ', "+");
    [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&input).ok())
        .ok_or_else(|| GatewayError::TokenDecryption("invalid base64".into()))
}
