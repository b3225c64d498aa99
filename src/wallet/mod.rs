//! Key custody.
//!
//! Imports and generates Solana Ed25519 keypairs in the standard 64-byte
//! `seed || public` layout, base58-encoded. The secret half is kept behind
//! `secrecy` and is never logged.

pub mod transaction;

use ed25519_dalek::{Signature, Signer, SigningKey};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::types::CycleError;

/// Length of a Solana keypair in bytes.
pub const KEYPAIR_LEN: usize = 64;

/// A custodied signing keypair.
pub struct Keypair {
    signing: SigningKey,
    public_key: String,
    secret_b58: SecretString,
}

impl Keypair {
    /// Import a base58-encoded 64-byte keypair.
    ///
    /// The first 32 bytes are the Ed25519 seed, the last 32 the public key.
    /// Both halves must agree.
    pub fn from_base58(encoded: &str) -> Result<Self, CycleError> {
        let trimmed = encoded.trim();
        let bytes = bs58::decode(trimmed)
            .into_vec()
            .map_err(|e| CycleError::InvalidKey(e.to_string()))?;

        let bytes: [u8; KEYPAIR_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CycleError::InvalidKey(format!(
                "Invalid key length: expected {KEYPAIR_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;

        let signing = SigningKey::from_keypair_bytes(&bytes)
            .map_err(|_| CycleError::InvalidKey("Public key does not match seed".into()))?;

        let public_key = bs58::encode(&bytes[32..]).into_string();

        Ok(Self {
            signing,
            public_key,
            secret_b58: SecretString::new(trimmed.to_string()),
        })
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::thread_rng());
        Self::from_signing_key(signing)
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let bytes = signing.to_keypair_bytes();
        let public_key = bs58::encode(signing.verifying_key().as_bytes()).into_string();
        let secret_b58 = SecretString::new(bs58::encode(bytes).into_string());
        Self {
            signing,
            public_key,
            secret_b58,
        }
    }

    /// Base58 public key (the wallet address).
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Base58 64-byte secret, for persistence.
    pub fn secret_base58(&self) -> &SecretString {
        &self.secret_b58
    }

    /// Sign arbitrary message bytes.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing: self.signing.clone(),
            public_key: self.public_key.clone(),
            secret_b58: SecretString::new(self.secret_b58.expose_secret().clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
