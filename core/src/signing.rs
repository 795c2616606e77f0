//! Signing and verification collaborators.
//!
//! The ticket layer never implements cryptography itself. It signs through a
//! [`Signer`], checks signatures through a [`Verifier`], and learns which
//! public keys belong to which user from a [`KeyDirectory`]. Ed25519
//! implementations backed by `ed25519-dalek` are provided.

use crate::ids::UserId;
use crate::transaction::Transaction;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use std::collections::HashMap;
use std::sync::RwLock;

/// Key material able to sign on behalf of one user.
pub trait Signer: Send + Sync {
    /// Public half of the key.
    fn public_key(&self) -> Vec<u8>;

    /// Sign `message`.
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Signature verification scheme.
pub trait Verifier: Send + Sync {
    /// Whether `signature` over `message` verifies under `public_key`.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Directory of the public keys registered to each user.
pub trait KeyDirectory: Send + Sync {
    /// Keys registered to `user_id` (empty if unknown).
    fn public_keys_of(&self, user_id: &UserId) -> Vec<Vec<u8>>;
}

/// Ed25519 signing key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Wrap a 32-byte secret.
    #[must_use]
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// Fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_secret(&rand::random())
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &hex::encode(self.key.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

impl Signer for Ed25519Signer {
    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().as_bytes().to_vec()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.key.sign(message).to_bytes().to_vec()
    }
}

/// Ed25519 verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_strict(message, &signature).is_ok()
    }
}

/// `HashMap`-backed key directory.
#[derive(Debug, Default)]
pub struct InMemoryKeyDirectory {
    keys: RwLock<HashMap<UserId, Vec<Vec<u8>>>>,
}

impl InMemoryKeyDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `public_key` for `user_id`.
    pub fn register(&self, user_id: UserId, public_key: Vec<u8>) {
        if let Ok(mut keys) = self.keys.write() {
            keys.entry(user_id).or_default().push(public_key);
        }
    }
}

impl KeyDirectory for InMemoryKeyDirectory {
    fn public_keys_of(&self, user_id: &UserId) -> Vec<Vec<u8>> {
        self.keys
            .read()
            .map(|keys| keys.get(user_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Check that each user in `required` has signed `tx` with a registered key.
///
/// Returns the first user whose signature is missing, made with an
/// unregistered key, or invalid.
///
/// # Errors
///
/// The offending [`UserId`].
pub fn verify_signers(
    tx: &Transaction,
    directory: &dyn KeyDirectory,
    verifier: &dyn Verifier,
    required: &[UserId],
) -> Result<(), UserId> {
    let message = tx.compute_id();
    for user in required {
        let Some(entry) = tx.signature_of(user) else {
            return Err(*user);
        };
        if !directory.public_keys_of(user).contains(&entry.public_key) {
            return Err(*user);
        }
        if !verifier.verify(&entry.public_key, message.as_bytes(), &entry.signature) {
            return Err(*user);
        }
    }
    Ok(())
}
