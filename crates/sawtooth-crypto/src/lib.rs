// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! secp256k1 signing for transaction, batch and block headers, plus the hash
//! helpers the rest of the validator builds identities and state addresses
//! from.
//!
//! Signatures are 64-byte compact ECDSA over the SHA-256 digest of the signed
//! bytes. Verification always runs against the exact bytes that were signed;
//! callers are expected to keep serialized headers around rather than
//! re-serializing parsed structures.

use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to parse key material: {0}")]
    ParseError(String),
    #[error("signing failed: {0}")]
    SigningError(String),
}

/// A secp256k1 private key.
#[derive(Clone)]
pub struct PrivateKey {
    inner: libsecp256k1::SecretKey,
}

impl PrivateKey {
    /// Generates a new key from OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        loop {
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            // Rejection-samples the (astronomically unlikely) out-of-range scalars.
            if let Ok(inner) = libsecp256k1::SecretKey::parse(&bytes) {
                return Self { inner };
            }
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::ParseError(e.to_string()))?;
        let inner = libsecp256k1::SecretKey::parse_slice(&bytes)
            .map_err(|e| CryptoError::ParseError(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: libsecp256k1::PublicKey::from_secret_key(&self.inner),
        }
    }

    /// Signs `message`, returning a 64-byte compact signature over its
    /// SHA-256 digest.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let digest = sha256(message);
        let msg = libsecp256k1::Message::parse(&digest);
        let (signature, _recovery_id) = libsecp256k1::sign(&msg, &self.inner);
        Signature {
            inner: signature,
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is never printed.
        f.write_str("PrivateKey(..)")
    }
}

/// A secp256k1 public key, rendered as 66 hex chars (compressed form).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: libsecp256k1::PublicKey,
}

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::ParseError(e.to_string()))?;
        let inner = libsecp256k1::PublicKey::parse_slice(
            &bytes,
            Some(libsecp256k1::PublicKeyFormat::Compressed),
        )
        .map_err(|e| CryptoError::ParseError(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.inner.serialize_compressed())
    }

    /// Verifies a compact signature over the SHA-256 digest of `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let digest = sha256(message);
        let msg = libsecp256k1::Message::parse(&digest);
        libsecp256k1::verify(&msg, &signature.inner, &self.inner)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// A 64-byte compact ECDSA signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    inner: libsecp256k1::Signature,
}

impl Signature {
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::ParseError(e.to_string()))?;
        if bytes.len() != 64 {
            return Err(CryptoError::ParseError(format!(
                "expected 64 signature bytes, got {}",
                bytes.len()
            )));
        }
        let mut compact = [0u8; 64];
        compact.copy_from_slice(&bytes);
        let inner = libsecp256k1::Signature::parse_standard(&compact)
            .map_err(|e| CryptoError::ParseError(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.inner.serialize())
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

pub fn sha512(bytes: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

pub fn sha512_hex(bytes: &[u8]) -> String {
    hex::encode(sha512(bytes))
}
