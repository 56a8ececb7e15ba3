/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate. Events and snapshots are hashed with
//!    distinct domain prefixes so that a signature over one can never be replayed as the other.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.

use rand_core::OsRng;

use super::data_types::{Address, CryptoHash, SignatureBytes};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

const EVENT_HASH_PREFIX: &[u8] = b"CSBLANCA";
const SNAPSHOT_HASH_PREFIX: &[u8] = b"SNAPSHOT";
const DELEGATE_PREFIX: &[u8] = b"DELEGATE";

/// A facade around [`SigningKey`] used by nodes and users to sign events, miniblock headers, and
/// snapshots.
#[derive(Clone)]
pub struct Wallet(SigningKey);

impl Wallet {
    /// Create a `Wallet` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Wallet {
        Wallet(signing_key)
    }

    /// Create a `Wallet` with a freshly generated key.
    pub fn generate() -> Wallet {
        Wallet(SigningKey::generate(&mut OsRng))
    }

    /// Sign an arbitrary `message` with the `Wallet`.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    pub fn address(&self) -> Address {
        Address::from(self.0.verifying_key())
    }
}

/// Hash of the serialized bytes of a stream event.
pub fn hash_event(bytes: &[u8]) -> CryptoHash {
    prefixed_hash(EVENT_HASH_PREFIX, bytes)
}

/// Hash of the serialized bytes of a snapshot.
pub fn hash_snapshot(bytes: &[u8]) -> CryptoHash {
    prefixed_hash(SNAPSHOT_HASH_PREFIX, bytes)
}

/// Message signed by a user to delegate event signing to `device_key` until `expiry_epoch_ms`.
pub fn delegate_message(device_key: &Address, expiry_epoch_ms: i64) -> Vec<u8> {
    let mut message = Vec::with_capacity(DELEGATE_PREFIX.len() + 32 + 8);
    message.extend_from_slice(DELEGATE_PREFIX);
    message.extend_from_slice(&device_key.bytes());
    message.extend_from_slice(&expiry_epoch_ms.to_le_bytes());
    message
}

/// Verify that `signature` over `message` was produced by `signer`.
pub fn verify(signer: &Address, message: &[u8], signature: &SignatureBytes) -> Result<(), SignatureError> {
    let verifying_key = signer.to_verifying_key()?;
    verifying_key.verify(message, &Signature::from_bytes(&signature.bytes()))
}

fn prefixed_hash(prefix: &[u8], bytes: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(prefix);
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}
