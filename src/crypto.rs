//! The `Crypto` capability boundary (§1, §6).
//!
//! Cryptographic primitive *implementations* are explicitly out of scope
//! for the core (§1): keypair generation, signing, AES-CTR, and
//! password-based key derivation are supplied by the embedding
//! application. This module defines only the contract the core consumes
//! when a caller opts in, plus the wire shape of an encrypted envelope
//! (§6, §9's note that the envelope `{ct, iv, s, v}` is preserved
//! regardless of which algorithm backs it).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GunError;

/// An encrypted blob as carried on the wire: ciphertext, iv/nonce, salt,
/// and the algorithm version string (§6, §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Ciphertext, base64 or hex encoded by the `Crypto` implementation —
    /// the core treats it as opaque.
    pub ct: String,
    /// IV/nonce, encoded the same way as `ct`.
    pub iv: String,
    /// KDF salt, encoded the same way as `ct`.
    pub s: String,
    /// Algorithm/version tag accompanying the envelope (§6).
    pub v: String,
}

/// An asymmetric keypair's public half, opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKey(pub String);

/// A detached signature, opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature(pub String);

/// The capability contract consumed by user-space code built on top of
/// this crate (§6). The core itself never constructs a default
/// implementation — callers supply one backed by whatever primitives
/// their deployment requires.
#[async_trait]
pub trait Crypto: Send + Sync {
    /// Generate a fresh asymmetric keypair usable for both signing and
    /// encryption; returns the opaque public half plus an implementation-
    /// defined private-key handle id.
    async fn generate_keypair(&self) -> Result<(PublicKey, String), GunError>;

    async fn sign(&self, private_key_handle: &str, message: &[u8]) -> Result<Signature, GunError>;

    async fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<bool, GunError>;

    /// Symmetric encrypt with a password-derived key (salted KDF).
    async fn encrypt(&self, password: &str, plaintext: &[u8]) -> Result<EncryptedEnvelope, GunError>;

    async fn decrypt(&self, password: &str, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, GunError>;

    /// Bounded-iteration proof-of-work, returning a nonce satisfying the
    /// implementation's difficulty predicate.
    async fn proof_of_work(&self, data: &[u8], max_iterations: u64) -> Result<Option<u64>, GunError>;
}
