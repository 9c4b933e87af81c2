//! GT-020: Secrets: sealed handles and secret stores.
//!
//! A secret value is encrypted with a per-process age (x25519) identity as
//! soon as it leaves the store. The resulting [`SecretHandle`] is what flows
//! through resolution and planning; it prints as `[sensitive]` and exposes a
//! keyed BLAKE3 fingerprint for diffing. The fingerprint key is derived from
//! a per-project salt kept outside the state directory, so recorded
//! fingerprints cannot be tested against guessed values without it.
//! Plaintext is recovered only by [`SecretHandle::reveal`].

mod store;

pub use store::{EnvSource, FileSource, MemorySource, SealingStore, SecretSource, SecretStore};

use crate::core::error::GantryError;
use crate::core::value::sensitive_fingerprint;
use std::fmt;
use std::sync::Arc;

const FINGERPRINT_CONTEXT: &str = "gantry 2026-01 secret fingerprint v1";

/// Holds the identity that seals and opens secret handles.
pub struct SecretVault {
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
    fingerprint_key: [u8; 32],
}

impl SecretVault {
    /// Create a vault with a fresh identity and no fingerprint salt.
    pub fn generate() -> Arc<Self> {
        Self::salted("")
    }

    /// Create a vault whose fingerprints are keyed by `salt`.
    pub fn salted(salt: &str) -> Arc<Self> {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        Arc::new(Self {
            identity,
            recipient,
            fingerprint_key: blake3::derive_key(FINGERPRINT_CONTEXT, salt.as_bytes()),
        })
    }

    /// Encrypt a plaintext secret into a handle.
    pub fn seal(self: &Arc<Self>, key: &str, plaintext: &str) -> Result<SecretHandle, GantryError> {
        let ciphertext = age::encrypt(&self.recipient, plaintext.as_bytes())
            .map_err(|e| GantryError::MissingSecret(format!("{}: cannot seal: {}", key, e)))?;
        Ok(SecretHandle {
            key: key.to_string(),
            ciphertext: Arc::from(ciphertext),
            fingerprint: fingerprint(&self.fingerprint_key, key, plaintext),
            vault: Arc::clone(self),
        })
    }

    fn open(&self, key: &str, ciphertext: &[u8]) -> Result<String, GantryError> {
        let plain = age::decrypt(&self.identity, ciphertext)
            .map_err(|e| GantryError::MissingSecret(format!("{}: cannot open: {}", key, e)))?;
        String::from_utf8(plain)
            .map_err(|_| GantryError::MissingSecret(format!("{}: not valid UTF-8", key)))
    }
}

impl fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretVault")
    }
}

/// Keyed fingerprint of a secret. Stable across processes with the same
/// salt so that recorded state can be compared without storing plaintext.
fn fingerprint(fingerprint_key: &[u8; 32], key: &str, plaintext: &str) -> String {
    let mut material = Vec::with_capacity(key.len() + plaintext.len() + 1);
    material.extend_from_slice(key.as_bytes());
    material.push(0);
    material.extend_from_slice(plaintext.as_bytes());
    let mac = blake3::keyed_hash(fingerprint_key, &material);
    sensitive_fingerprint(&format!("blake3:{}", mac.to_hex()))
}

/// Opaque handle to an encrypted secret.
#[derive(Clone)]
pub struct SecretHandle {
    key: String,
    ciphertext: Arc<[u8]>,
    fingerprint: String,
    vault: Arc<SecretVault>,
}

impl SecretHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Decrypt. Call only when injecting into a provider request.
    pub fn reveal(&self) -> Result<String, GantryError> {
        self.vault.open(&self.key, &self.ciphertext)
    }
}

impl fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHandle({}: [sensitive])", self.key)
    }
}

impl fmt::Display for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[sensitive]")
    }
}
