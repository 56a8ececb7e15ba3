/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed envelopes and the events inside them.
//!
//! An [`Envelope`] is the unit that travels between nodes and is persisted: the borsh bytes of a
//! [`StreamEvent`], the hash of those bytes, and the signature of the hash. [`ParsedEvent::parse`] is the
//! only way to turn an envelope back into an event, and it checks the hash and the signature on the way.

use std::fmt::{self, Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};
use rand::Rng;

use crate::errors::StreamError;

use super::crypto_primitives::{delegate_message, hash_event, verify, Wallet};
use super::data_types::{Address, CryptoHash, MiniblockRef, SignatureBytes};
use super::payloads::Payload;

#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Envelope {
    pub hash: CryptoHash,
    pub signature: SignatureBytes,
    pub event: Vec<u8>,
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope({}, {} bytes)", self.hash, self.event.len())
    }
}

/// Permission for a device key to sign events on behalf of a user.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Delegation {
    pub device_key: Address,
    /// Signature by the creator over [`delegate_message`].
    pub signature: SignatureBytes,
    /// Zero means the delegation never expires.
    pub expiry_epoch_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct StreamEvent {
    pub creator_address: Address,
    pub salt: Vec<u8>,
    /// Hash of the miniblock the creator saw last. `None` only for genesis events.
    pub prev_miniblock_hash: Option<CryptoHash>,
    pub prev_miniblock_num: Option<i64>,
    pub created_at_epoch_ms: i64,
    pub delegate: Option<Delegation>,
    pub payload: Payload,
}

impl StreamEvent {
    /// A new event created by `creator` that references `prev` as its last known miniblock.
    pub fn new(creator: Address, payload: Payload, prev: Option<MiniblockRef>) -> StreamEvent {
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill(&mut salt[..]);
        StreamEvent {
            creator_address: creator,
            salt,
            prev_miniblock_hash: prev.map(|prev| prev.hash),
            prev_miniblock_num: prev.map(|prev| prev.num),
            created_at_epoch_ms: epoch_millis(),
            delegate: None,
            payload,
        }
    }
}

/// Serialize, hash and sign `event`.
pub fn make_envelope(wallet: &Wallet, event: &StreamEvent) -> Result<Envelope, StreamError> {
    let bytes = event
        .try_to_vec()
        .map_err(|err| StreamError::internal(format!("failed to serialize event: {}", err)))?;
    let hash = hash_event(&bytes);
    let signature = wallet.sign(&hash.bytes());
    Ok(Envelope { hash, signature, event: bytes })
}

/// Create, sign and parse an event in one go.
pub fn make_parsed_event(
    wallet: &Wallet,
    payload: Payload,
    prev: Option<MiniblockRef>,
) -> Result<ParsedEvent, StreamError> {
    let event = StreamEvent::new(wallet.address(), payload, prev);
    let envelope = make_envelope(wallet, &event)?;
    Ok(ParsedEvent { hash: envelope.hash, event, envelope })
}

/// An envelope whose hash and signature have been verified, together with the decoded event.
#[derive(Clone)]
pub struct ParsedEvent {
    pub event: StreamEvent,
    pub envelope: Envelope,
    pub hash: CryptoHash,
}

impl ParsedEvent {
    pub fn parse(envelope: Envelope) -> Result<ParsedEvent, StreamError> {
        let computed = hash_event(&envelope.event);
        if computed != envelope.hash {
            return Err(StreamError::BadEventHash { expected: envelope.hash, actual: computed });
        }

        let event = StreamEvent::try_from_slice(&envelope.event)
            .map_err(|err| StreamError::bad_event(format!("failed to decode event {}: {}", envelope.hash, err)))?;

        let bad_signature = |reason: String| StreamError::BadEventSignature { event: envelope.hash, reason };
        match &event.delegate {
            Some(delegate) => {
                verify(&delegate.device_key, &envelope.hash.bytes(), &envelope.signature)
                    .map_err(|err| bad_signature(format!("device signature: {}", err)))?;
                verify(
                    &event.creator_address,
                    &delegate_message(&delegate.device_key, delegate.expiry_epoch_ms),
                    &delegate.signature,
                )
                .map_err(|err| bad_signature(format!("delegate signature: {}", err)))?;
                if delegate.expiry_epoch_ms > 0 && epoch_millis() > delegate.expiry_epoch_ms {
                    return Err(bad_signature("delegation expired".to_string()));
                }
            }
            None => {
                verify(&event.creator_address, &envelope.hash.bytes(), &envelope.signature)
                    .map_err(|err| bad_signature(format!("creator signature: {}", err)))?;
            }
        }

        Ok(ParsedEvent { hash: envelope.hash, event, envelope })
    }

    pub fn parse_all(envelopes: &[Envelope]) -> Result<Vec<ParsedEvent>, StreamError> {
        envelopes.iter().cloned().map(ParsedEvent::parse).collect()
    }

    pub fn creator(&self) -> &Address {
        &self.event.creator_address
    }

    pub fn payload(&self) -> &Payload {
        &self.event.payload
    }

    /// The miniblock this event claims as its predecessor.
    pub fn prev_miniblock_hash(&self) -> Option<CryptoHash> {
        self.event.prev_miniblock_hash
    }

    pub fn prev_miniblock_num(&self) -> Option<i64> {
        self.event.prev_miniblock_num
    }

    /// Size of the envelope on the wire, used for miniblock size limits.
    pub fn size(&self) -> usize {
        self.envelope.event.len() + 64 + 32
    }

    pub fn short_debug_str(&self) -> String {
        format!("{}:{}", self.event.payload.kind(), self.hash)
    }
}

impl Debug for ParsedEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ParsedEvent({})", self.short_debug_str())
    }
}

pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}
