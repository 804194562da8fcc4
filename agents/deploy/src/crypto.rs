//! At-rest protection for stored passwords.
//!
//! AES-256-GCM with a random 12 byte nonce prepended to the ciphertext.
//! The key is derived from host and user identity, so the file is only
//! useful on the machine and account that wrote it. This keeps passwords
//! off disk in plaintext; it does not protect against someone who already
//! has access to this account.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext too short")]
    TooShort,
    #[error("encrypt failed")]
    Encrypt,
    #[error("decrypt failed")]
    Decrypt,
}

/// SHA-256 of `deploy-agent:<hostname>:<username>:<home>:v1`.
pub fn derive_key() -> [u8; 32] {
    let hostname = taskrelay::conf::hostname().unwrap_or_default();
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let home = dirs::home_dir()
        .map(|h| h.display().to_string())
        .unwrap_or_default();
    key_from(&hostname, &username, &home)
}

fn key_from(hostname: &str, username: &str, home: &str) -> [u8; 32] {
    let material = format!("deploy-agent:{}:{}:{}:v1", hostname, username, home);
    Sha256::digest(material.as_bytes()).into()
}

pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::TooShort);
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Decrypt)
}
