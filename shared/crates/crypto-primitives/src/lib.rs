// Shared Cryptographic Primitives
// Hashing, HMAC, constant-time comparison and signing used across the
// sovereign document control platform.

//! # Crypto Primitives
//!
//! Low-level cryptographic building blocks shared by every component that
//! needs a hash, an HMAC, or a timing-safe comparison. Kept deliberately
//! free of any document- or ledger-specific types so it can be audited in
//! isolation.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("signature verification failed")]
    SignatureVerificationFailed,
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),
    #[error("hmac key setup failed: {0}")]
    HmacKeyError(String),
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 raw digest of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Concatenate two hashes and hash the result, used by Merkle folding
/// throughout the canonicalizer and diff engine.
pub fn hash_pair(left: &[u8], right: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Constant-time byte comparison. Always walks the full, longer-padded
/// length so execution time does not leak which byte first differs.
///
/// Unequal lengths short-circuit to `false` only after comparing up to the
/// longest length against a zero-extended buffer, so length itself is the
/// only observable signal. Callers only ever compare fixed-width hex
/// digests and secrets here, never variable-length user input.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff: u8 = (a.len() != b.len()) as u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

/// HMAC-SHA256 signer/verifier over a caller-supplied secret.
pub struct HmacKey {
    secret: Vec<u8>,
}

impl HmacKey {
    pub fn from_bytes(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    pub fn sign_hex(&self, data: &[u8]) -> Result<String, CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CryptoError::HmacKeyError(e.to_string()))?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a lowercase-hex signature using a constant-time comparison
    /// over the decoded bytes (never the hex string, and never an early
    /// return on the first differing byte).
    pub fn verify_hex(&self, data: &[u8], signature_hex: &str) -> Result<bool, CryptoError> {
        let expected = self.sign_hex(data)?;
        let expected_bytes = hex::decode(&expected).unwrap_or_default();
        let supplied_bytes = hex::decode(signature_hex).unwrap_or_default();
        Ok(constant_time_eq(&expected_bytes, &supplied_bytes))
    }
}

/// Ed25519 key pair used for signature certificates (C10).
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519KeyPair {
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = Signature::from_bytes(signature);
        self.verifying_key
            .verify(data, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// Random byte generation for tokens, entry ids, and watermark ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SecureRandom;

impl SecureRandom {
    pub fn bytes(len: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    pub fn hex(len: usize) -> String {
        hex::encode(Self::bytes(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic() {
        let a = sha256_hex(b"hello world");
        let b = sha256_hex(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn hmac_round_trip() {
        let key = HmacKey::from_bytes(b"shh");
        let sig = key.sign_hex(b"2025-01-01T00:00:00Z.{\"a\":1}").unwrap();
        assert!(key
            .verify_hex(b"2025-01-01T00:00:00Z.{\"a\":1}", &sig)
            .unwrap());
        let mut tampered = sig.clone();
        let last = tampered.pop().unwrap();
        let replaced = if last == '0' { '1' } else { '0' };
        tampered.push(replaced);
        assert!(!key
            .verify_hex(b"2025-01-01T00:00:00Z.{\"a\":1}", &tampered)
            .unwrap());
    }

    #[test]
    fn ed25519_round_trip() {
        let pair = Ed25519KeyPair::generate();
        let sig = pair.sign(b"certificate body");
        pair.verify(b"certificate body", &sig).unwrap();
    }

    #[test]
    fn secure_random_is_not_constant() {
        let a = SecureRandom::bytes(32);
        let b = SecureRandom::bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
