//! Client-side hybrid encryption envelope.
//!
//! The algorithm set is fixed by the deployed clients: RSA with PKCS#1 v1.5
//! key wrapping, HMAC-SHA-256 over the ciphertext, AES-CBC with PKCS#7
//! padding.

use aes::{Aes128, Aes192, Aes256};
use anyhow::Context;
use base64::prelude::*;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

const AES_BLOCK_SIZE: usize = 16;
const EXPECTED_KEY_BITS: usize = 4096;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("can't unwrap MAC key")]
    UnwrapMacKeyFailed,

    #[error("can't unwrap encryption key")]
    UnwrapEncKeyFailed,

    #[error("MAC verification failed")]
    MacMismatch,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid padding")]
    PaddingInvalid,
}

impl EnvelopeError {
    /// Whether this failure warrants an email to the operator.
    pub fn notifies_operator(&self) -> bool {
        matches!(self, EnvelopeError::MacMismatch | EnvelopeError::PaddingInvalid)
    }
}

/// The five-field object a client attaches to a feedback submission.
/// Every field is base64 and untrusted until the MAC checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub content_ciphertext: String,
    pub content_mac: String,
    pub wrapped_encryption_key: String,
    pub wrapped_mac_key: String,
    pub iv: String,
}

impl Envelope {
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Parses an envelope that may additionally be base64-wrapped, as it is
    /// when carried as an email attachment.
    pub fn from_attachment(data: &[u8]) -> Option<Self> {
        if let Ok(envelope) = Self::from_json(data) {
            return Some(envelope);
        }
        let compact: Vec<u8> = data
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let decoded = BASE64_STANDARD.decode(compact).ok()?;
        Self::from_json(&decoded).ok()
    }

    /// Builds an envelope the way a client does: fresh AES-128 and MAC keys,
    /// both wrapped for `public`.
    pub fn seal<R: CryptoRng + RngCore>(
        public: &RsaPublicKey,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Self, rsa::Error> {
        let mut enc_key = [0u8; 16];
        let mut mac_key = [0u8; 32];
        let mut iv = [0u8; AES_BLOCK_SIZE];
        rng.fill_bytes(&mut enc_key);
        rng.fill_bytes(&mut mac_key);
        rng.fill_bytes(&mut iv);

        let ciphertext = cbc::Encryptor::<Aes128>::new(&enc_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key)
            .map_err(|_| rsa::Error::InvalidArguments)?;
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        Ok(Envelope {
            content_ciphertext: BASE64_STANDARD.encode(&ciphertext),
            content_mac: BASE64_STANDARD.encode(tag),
            wrapped_encryption_key: BASE64_STANDARD
                .encode(public.encrypt(rng, Pkcs1v15Encrypt, &enc_key)?),
            wrapped_mac_key: BASE64_STANDARD.encode(public.encrypt(rng, Pkcs1v15Encrypt, &mac_key)?),
            iv: BASE64_STANDARD.encode(iv),
        })
    }
}

struct DecodedEnvelope {
    ciphertext: Vec<u8>,
    mac: Vec<u8>,
    wrapped_encryption_key: Vec<u8>,
    wrapped_mac_key: Vec<u8>,
    iv: Vec<u8>,
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, EnvelopeError> {
    BASE64_STANDARD
        .decode(value.trim())
        .map_err(|e| EnvelopeError::MalformedEnvelope(format!("{name} is not base64: {e}")))
}

impl DecodedEnvelope {
    fn decode(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        Ok(DecodedEnvelope {
            ciphertext: decode_field("contentCiphertext", &envelope.content_ciphertext)?,
            mac: decode_field("contentMac", &envelope.content_mac)?,
            wrapped_encryption_key: decode_field(
                "wrappedEncryptionKey",
                &envelope.wrapped_encryption_key,
            )?,
            wrapped_mac_key: decode_field("wrappedMacKey", &envelope.wrapped_mac_key)?,
            iv: decode_field("iv", &envelope.iv)?,
        })
    }
}

/// The long-lived RSA key that unwraps envelope keys. Loaded once per
/// worker at startup.
#[derive(Clone)]
pub struct EnvelopeKey {
    key: RsaPrivateKey,
}

impl fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeKey")
            .field("bits", &(self.key.size() * 8))
            .finish_non_exhaustive()
    }
}

impl EnvelopeKey {
    pub fn new(key: RsaPrivateKey) -> Self {
        EnvelopeKey { key }
    }

    /// Loads a PEM key. Encrypted PKCS#8 keys need `password`; unencrypted
    /// PKCS#1 and PKCS#8 keys are accepted with or without one.
    pub fn from_pem(pem: &str, password: Option<&str>) -> anyhow::Result<Self> {
        let password = password.filter(|p| !p.is_empty());

        let key = if pem.contains("ENCRYPTED PRIVATE KEY") {
            let password =
                password.context("private key is encrypted but no password is configured")?;
            RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password.as_bytes())
                .context("failed to decrypt PKCS#8 private key")?
        } else if pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(pem).context("failed to parse PKCS#1 private key")?
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem).context("failed to parse PKCS#8 private key")?
        };

        let bits = key.size() * 8;
        if bits != EXPECTED_KEY_BITS {
            log::warn!("Private key is {bits} bits; deployed clients wrap with {EXPECTED_KEY_BITS}");
        }

        Ok(EnvelopeKey { key })
    }

    pub fn from_file(path: &str, password: Option<&str>) -> anyhow::Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read private key file: {path}"))?;
        Self::from_pem(&pem, password)
    }

    /// Authenticates and decrypts an envelope, returning the cleartext.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
        let decoded = DecodedEnvelope::decode(envelope)?;

        let mac_key = self
            .key
            .decrypt(Pkcs1v15Encrypt, &decoded.wrapped_mac_key)
            .map_err(|_| EnvelopeError::UnwrapMacKeyFailed)?;

        // The MAC is checked before the encryption key is touched.
        let mut mac = HmacSha256::new_from_slice(&mac_key)
            .map_err(|_| EnvelopeError::UnwrapMacKeyFailed)?;
        mac.update(&decoded.ciphertext);
        let computed = mac.finalize().into_bytes();
        if !bool::from(computed.as_slice().ct_eq(&decoded.mac)) {
            return Err(EnvelopeError::MacMismatch);
        }

        let enc_key = self
            .key
            .decrypt(Pkcs1v15Encrypt, &decoded.wrapped_encryption_key)
            .map_err(|_| EnvelopeError::UnwrapEncKeyFailed)?;

        let padded = aes_cbc_decrypt(&enc_key, &decoded.iv, decoded.ciphertext)?;
        pkcs7_unpad(padded)
    }
}

fn aes_cbc_decrypt(key: &[u8], iv: &[u8], mut buf: Vec<u8>) -> Result<Vec<u8>, EnvelopeError> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(EnvelopeError::MalformedEnvelope(format!(
            "iv must be {AES_BLOCK_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    if buf.is_empty() || buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(EnvelopeError::MalformedEnvelope(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            buf.len()
        )));
    }

    let bad_length = |_| EnvelopeError::MalformedEnvelope("bad key or iv length".to_string());
    let bad_blocks = |_| EnvelopeError::MalformedEnvelope("ciphertext not block aligned".to_string());

    let len = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_length)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(bad_blocks)?
            .len(),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_length)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(bad_blocks)?
            .len(),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_length)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(bad_blocks)?
            .len(),
        other => {
            return Err(EnvelopeError::MalformedEnvelope(format!(
                "unsupported AES key size: {other} bytes"
            )))
        }
    };
    buf.truncate(len);
    Ok(buf)
}

/// Strips PKCS#5/#7 padding, checking every padding byte.
fn pkcs7_unpad(mut padded: Vec<u8>) -> Result<Vec<u8>, EnvelopeError> {
    let pad = match padded.last() {
        Some(&pad) => pad as usize,
        None => return Err(EnvelopeError::PaddingInvalid),
    };
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > padded.len() {
        return Err(EnvelopeError::PaddingInvalid);
    }
    let start = padded.len() - pad;
    if padded[start..].iter().any(|&b| b as usize != pad) {
        return Err(EnvelopeError::PaddingInvalid);
    }
    padded.truncate(start);
    Ok(padded)
}
