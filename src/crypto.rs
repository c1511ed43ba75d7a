//! Payload sealing.
//!
//! The shared secret doubles as the encryption key: AES-256-GCM under a
//! SHA-256 digest of the password, random 96-bit nonce prepended to the
//! ciphertext. Authenticated decryption is what proves possession of the
//! secret, so tampering and wrong passwords are indistinguishable here.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{DeployError, Result};

const NONCE_LEN: usize = 12;

/// Derive the fixed-size symmetric key from a password.
pub fn derive_key(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

/// Encrypt and authenticate a payload. Output is `nonce || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| DeployError::Sealed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| DeployError::Sealed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt and verify a sealed payload.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(DeployError::Sealed);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| DeployError::Sealed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DeployError::Sealed)
}
