/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Defines the [KVStore] trait, which specifies the required interface for the key-value store provided
//! by the user.
//!
//! Given a method to obtain the value for a given key in bytes, this module also provides methods to
//! obtain the stream variables stored in the key-value store, as described in [super::variables].

use std::fmt::Display;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{CryptoHash, StreamId};

use super::variables::{self, candidate_key, miniblock_key, stream_key};
use super::write_batch::WriteBatch;
use super::MiniblockDescriptor;

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Apply every write in `wb` atomically.
    fn write(&mut self, wb: Self::WriteBatch);
}

/// Per-stream bookkeeping. Kept in one value because [`KVGet`] cannot scan key ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct StreamMeta {
    /// Disjoint, ascending, non-adjacent ranges of stored miniblock numbers.
    pub ranges: Vec<(i64, i64)>,
    /// Ascending numbers of stored miniblocks that carry a snapshot.
    pub snapshot_nums: Vec<i64>,
    /// Ascending numbers for which candidates are stored.
    pub candidate_nums: Vec<i64>,
    pub is_ephemeral: bool,
}

impl StreamMeta {
    pub fn last_miniblock_num(&self) -> Option<i64> {
        self.ranges.last().map(|(_, end)| *end)
    }

    pub fn contains(&self, num: i64) -> bool {
        self.ranges.iter().any(|(start, end)| *start <= num && num <= *end)
    }

    /// Add `[start, end]`, merging overlapping and adjacent ranges.
    pub fn add_range(&mut self, start: i64, end: i64) {
        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(self.ranges.len() + 1);
        let mut ranges = self.ranges.clone();
        ranges.push((start, end));
        ranges.sort();
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
    }

    pub fn add_snapshot_num(&mut self, num: i64) {
        if let Err(i) = self.snapshot_nums.binary_search(&num) {
            self.snapshot_nums.insert(i, num);
        }
    }

    pub fn add_candidate_num(&mut self, num: i64) {
        if let Err(i) = self.candidate_nums.binary_search(&num) {
            self.candidate_nums.insert(i, num);
        }
    }
}

/// Events of the current, not yet sealed, generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct StoredMinipool {
    pub generation: i64,
    pub envelopes: Vec<Vec<u8>>,
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Stream meta ↓↓↓ */

    fn stream_meta(&self, stream_id: &StreamId) -> Result<Option<StreamMeta>, KVGetError> {
        if let Some(bytes) = self.get(&stream_key(&variables::STREAM_META, stream_id)) {
            Ok(Some(
                StreamMeta::deserialize(&mut bytes.as_slice())
                    .map_err(|err| KVGetError::DeserializeValueError { key: Key::StreamMeta { stream_id: stream_id.clone() }, source: err })?,
            ))
        } else {
            Ok(None)
        }
    }

    /* ↓↓↓ Miniblocks ↓↓↓ */

    fn miniblock(&self, stream_id: &StreamId, num: i64) -> Result<Option<MiniblockDescriptor>, KVGetError> {
        if let Some(bytes) = self.get(&miniblock_key(&variables::MINIBLOCKS, stream_id, num)) {
            Ok(Some(
                MiniblockDescriptor::deserialize(&mut &*bytes).map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::Miniblock { stream_id: stream_id.clone(), num },
                    source: err,
                })?,
            ))
        } else {
            Ok(None)
        }
    }

    /* ↓↓↓ Minipool ↓↓↓ */

    fn minipool(&self, stream_id: &StreamId) -> Result<StoredMinipool, KVGetError> {
        StoredMinipool::deserialize(
            &mut &*self
                .get(&stream_key(&variables::MINIPOOL, stream_id))
                .ok_or(KVGetError::ValueNotFound { key: Key::Minipool { stream_id: stream_id.clone() } })?,
        )
        .map_err(|err| KVGetError::DeserializeValueError { key: Key::Minipool { stream_id: stream_id.clone() }, source: err })
    }

    /* ↓↓↓ Candidates ↓↓↓ */

    fn candidate(&self, stream_id: &StreamId, num: i64, hash: &CryptoHash) -> Result<Option<MiniblockDescriptor>, KVGetError> {
        if let Some(bytes) = self.get(&candidate_key(stream_id, num, hash)) {
            Ok(Some(
                MiniblockDescriptor::deserialize(&mut &*bytes).map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::Candidate { stream_id: stream_id.clone(), num, hash: *hash },
                    source: err,
                })?,
            ))
        } else {
            Ok(None)
        }
    }

    fn candidate_hashes(&self, stream_id: &StreamId, num: i64) -> Result<Vec<CryptoHash>, KVGetError> {
        if let Some(bytes) = self.get(&miniblock_key(&variables::CANDIDATE_HASHES, stream_id, num)) {
            Vec::<CryptoHash>::deserialize(&mut &*bytes).map_err(|err| KVGetError::DeserializeValueError {
                key: Key::CandidateHashes { stream_id: stream_id.clone(), num },
                source: err,
            })
        } else {
            Ok(Vec::new())
        }
    }
}

#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
    ValueNotFound { key: Key },
}

#[derive(Debug)]
pub enum Key {
    StreamMeta { stream_id: StreamId },
    Miniblock { stream_id: StreamId, num: i64 },
    Minipool { stream_id: StreamId },
    Candidate { stream_id: StreamId, num: i64, hash: CryptoHash },
    CandidateHashes { stream_id: StreamId, num: i64 },
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            &Key::StreamMeta { stream_id } => write!(f, "Stream Meta for stream {}", stream_id),
            &Key::Miniblock { stream_id, num } => write!(f, "Miniblock {} of stream {}", num, stream_id),
            &Key::Minipool { stream_id } => write!(f, "Minipool of stream {}", stream_id),
            &Key::Candidate { stream_id, num, hash } => {
                write!(f, "Miniblock Candidate {} at {} of stream {}", hash, num, stream_id)
            }
            &Key::CandidateHashes { stream_id, num } => {
                write!(f, "Miniblock Candidate hashes at {} of stream {}", num, stream_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_merge() {
        let mut meta = StreamMeta::default();
        meta.add_range(0, 0);
        meta.add_range(5, 7);
        meta.add_range(1, 2);
        assert_eq!(meta.ranges, vec![(0, 2), (5, 7)]);
        meta.add_range(3, 4);
        assert_eq!(meta.ranges, vec![(0, 7)]);
        meta.add_range(10, 12);
        assert_eq!(meta.last_miniblock_num(), Some(12));
        assert!(meta.contains(6));
        assert!(!meta.contains(9));
    }
}
