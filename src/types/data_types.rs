/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::fmt::{self, Debug, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use rand::Rng;

use super::crypto_primitives::{CryptoHasher, Digest, SignatureError, VerifyingKey};

/// 32-byte SHA256 hash.
///
/// Event hashes, miniblock hashes (the hash of the header event), and snapshot hashes are all
/// `CryptoHash`es. The all-zero hash is used as "no hash", e.g. as the previous miniblock hash of a
/// genesis miniblock.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zero hash.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Hash `bytes` with SHA256.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = CryptoHasher::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Address of a node or a user: the bytes of an Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct Address([u8; 32]);

impl Address {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn to_verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }
}

impl From<VerifyingKey> for Address {
    fn from(value: VerifyingKey) -> Self {
        Address(value.to_bytes())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Kind of a stream, stored as the first byte of its [`StreamId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub enum StreamType {
    Space,
    Channel,
    Media,
    DmChannel,
    GdmChannel,
    Metadata,
    User,
    UserMetadata,
    UserInbox,
    UserSettings,
}

impl StreamType {
    pub const fn prefix(&self) -> u8 {
        match self {
            StreamType::Space => 0x10,
            StreamType::Channel => 0x20,
            StreamType::Media => 0xff,
            StreamType::DmChannel => 0x88,
            StreamType::GdmChannel => 0x77,
            StreamType::Metadata => 0xdd,
            StreamType::User => 0xa8,
            StreamType::UserMetadata => 0xad,
            StreamType::UserInbox => 0xa1,
            StreamType::UserSettings => 0xa5,
        }
    }

    pub fn from_prefix(prefix: u8) -> Option<StreamType> {
        match prefix {
            0x10 => Some(StreamType::Space),
            0x20 => Some(StreamType::Channel),
            0xff => Some(StreamType::Media),
            0x88 => Some(StreamType::DmChannel),
            0x77 => Some(StreamType::GdmChannel),
            0xdd => Some(StreamType::Metadata),
            0xa8 => Some(StreamType::User),
            0xad => Some(StreamType::UserMetadata),
            0xa1 => Some(StreamType::UserInbox),
            0xa5 => Some(StreamType::UserSettings),
            _ => None,
        }
    }

    /// User-owned streams embed the owner's address after the prefix byte.
    pub const fn is_user_type(&self) -> bool {
        matches!(
            self,
            StreamType::User | StreamType::UserMetadata | StreamType::UserInbox | StreamType::UserSettings
        )
    }
}

/// Identifier of a stream.
///
/// The first byte is the [`StreamType`] prefix. User-owned streams are the prefix followed by the 32-byte
/// owner address (33 bytes in total). All other streams are 32 bytes: the prefix and 31 bytes of id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct StreamId(Vec<u8>);

impl StreamId {
    pub const STREAM_ID_LEN: usize = 32;
    pub const USER_STREAM_ID_LEN: usize = 33;

    /// Validate and wrap `bytes`.
    pub fn new(bytes: Vec<u8>) -> Option<StreamId> {
        let stream_type = StreamType::from_prefix(*bytes.first()?)?;
        let expected_len = if stream_type.is_user_type() { Self::USER_STREAM_ID_LEN } else { Self::STREAM_ID_LEN };
        if bytes.len() != expected_len {
            return None;
        }
        Some(StreamId(bytes))
    }

    /// Random id for a non-user stream.
    pub fn random(stream_type: StreamType) -> StreamId {
        let mut bytes = vec![0u8; Self::STREAM_ID_LEN];
        rand::thread_rng().fill(&mut bytes[1..]);
        bytes[0] = stream_type.prefix();
        StreamId(bytes)
    }

    /// Id of a user-owned stream of `stream_type` for `user`.
    pub fn for_user(stream_type: StreamType, user: &Address) -> StreamId {
        let mut bytes = Vec::with_capacity(Self::USER_STREAM_ID_LEN);
        bytes.push(stream_type.prefix());
        bytes.extend_from_slice(&user.bytes());
        StreamId(bytes)
    }

    /// Deterministic id of the DM stream between two users, independent of their order.
    pub fn for_dm(first: &Address, second: &Address) -> StreamId {
        let (low, high) = if first <= second { (first, second) } else { (second, first) };
        let mut hasher = CryptoHasher::new();
        hasher.update(low.bytes());
        hasher.update(high.bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let mut bytes = digest.to_vec();
        bytes[0] = StreamType::DmChannel.prefix();
        StreamId(bytes)
    }

    /// Id of the default channel of `space`: the space id with the channel prefix.
    pub fn default_channel_for(space: &StreamId) -> StreamId {
        let mut bytes = space.0.clone();
        if let Some(first) = bytes.first_mut() {
            *first = StreamType::Channel.prefix();
        }
        StreamId(bytes)
    }

    pub fn is_default_channel_of(&self, space: &StreamId) -> bool {
        *self == Self::default_channel_for(space)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        self.0.first().and_then(|prefix| StreamType::from_prefix(*prefix))
    }

    /// Owner of a user-owned stream.
    pub fn user_address(&self) -> Option<Address> {
        match self.stream_type() {
            Some(stream_type) if stream_type.is_user_type() => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&self.0[1..Self::USER_STREAM_ID_LEN]);
                Some(Address::new(bytes))
            }
            _ => None,
        }
    }

    /// Media streams are written by a single node and never replicated through quorum.
    pub fn is_replicated_type(&self) -> bool {
        self.stream_type() != Some(StreamType::Media)
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(10) {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Hash and number of a miniblock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct MiniblockRef {
    pub hash: CryptoHash,
    pub num: i64,
}

impl MiniblockRef {
    pub const fn new(hash: CryptoHash, num: i64) -> Self {
        Self { hash, num }
    }
}

impl Display for MiniblockRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.num, self.hash)
    }
}

impl Debug for MiniblockRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Number of a block of the external registry. Drives leader rotation and candidate throttling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockNumber(u64);

impl BlockNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for BlockNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
