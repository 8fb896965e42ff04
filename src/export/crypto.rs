//! Authenticated encryption for ERP connection configs.
//!
//! AES-256-GCM with a key derived from the process pepper via HKDF-SHA256
//! and a static info string. The stored record carries version, nonce,
//! ciphertext and the context string used as associated data; version
//! mismatches and tampered records are rejected.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const HKDF_INFO: &[u8] = b"orderflow-config-encryption-v1";
const RECORD_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub v: u32,
    /// Base64 nonce (96 bits).
    pub n: String,
    /// Base64 ciphertext including the GCM tag.
    pub c: String,
    /// Associated-data context, e.g. "erp_connection:{id}".
    pub ctx: Option<String>,
}

pub struct ConfigCrypto {
    key: [u8; 32],
}

impl ConfigCrypto {
    pub fn new(pepper: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(None, pepper.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key).expect("32 bytes is a valid hkdf length");
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &serde_json::Value, context: Option<&str>) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let message = serde_json::to_vec(plaintext)?;
        let aad = context.unwrap_or("").as_bytes();
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: &message, aad })
            .map_err(|_| anyhow!("encryption failed"))?;

        let record = EncryptedRecord {
            v: RECORD_VERSION,
            n: BASE64.encode(nonce_bytes),
            c: BASE64.encode(ciphertext),
            ctx: context.map(str::to_string),
        };
        Ok(serde_json::to_string(&record)?)
    }

    pub fn decrypt(&self, stored: &str) -> Result<serde_json::Value> {
        let record: EncryptedRecord =
            serde_json::from_str(stored).context("parse encrypted record")?;
        if record.v != RECORD_VERSION {
            bail!("unsupported encryption record version {}", record.v);
        }
        let nonce_bytes = BASE64.decode(&record.n).context("decode nonce")?;
        let ciphertext = BASE64.decode(&record.c).context("decode ciphertext")?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let aad = record.ctx.as_deref().unwrap_or("").as_bytes();
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|_| anyhow!("decryption failed: wrong key or tampered record"))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
