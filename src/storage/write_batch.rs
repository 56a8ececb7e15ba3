/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Write batches: sets of writes that are applied to the key-value store atomically.

use borsh::BorshSerialize;

use crate::errors::StreamError;
use crate::types::data_types::{CryptoHash, StreamId};

use super::pluggables::{Key, StoredMinipool, StreamMeta};
use super::variables::{self, candidate_key, miniblock_key, stream_key};
use super::MiniblockDescriptor;

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// Wraps a user-provided [`WriteBatch`] and forms the keys of stream variables.
pub struct StreamWriteBatch<W: WriteBatch>(pub(super) W);

impl<W: WriteBatch> StreamWriteBatch<W> {
    pub(crate) fn new() -> StreamWriteBatch<W> {
        StreamWriteBatch(W::new())
    }

    pub fn set_stream_meta(&mut self, stream_id: &StreamId, meta: &StreamMeta) -> Result<(), StreamError> {
        self.0.set(
            &stream_key(&variables::STREAM_META, stream_id),
            &serialize(meta, Key::StreamMeta { stream_id: stream_id.clone() })?,
        );
        Ok(())
    }

    pub fn set_miniblock(&mut self, stream_id: &StreamId, miniblock: &MiniblockDescriptor) -> Result<(), StreamError> {
        self.0.set(
            &miniblock_key(&variables::MINIBLOCKS, stream_id, miniblock.number),
            &serialize(miniblock, Key::Miniblock { stream_id: stream_id.clone(), num: miniblock.number })?,
        );
        Ok(())
    }

    pub fn set_minipool(&mut self, stream_id: &StreamId, minipool: &StoredMinipool) -> Result<(), StreamError> {
        self.0.set(
            &stream_key(&variables::MINIPOOL, stream_id),
            &serialize(minipool, Key::Minipool { stream_id: stream_id.clone() })?,
        );
        Ok(())
    }

    pub fn set_candidate(&mut self, stream_id: &StreamId, candidate: &MiniblockDescriptor) -> Result<(), StreamError> {
        self.0.set(
            &candidate_key(stream_id, candidate.number, &candidate.hash),
            &serialize(
                candidate,
                Key::Candidate { stream_id: stream_id.clone(), num: candidate.number, hash: candidate.hash },
            )?,
        );
        Ok(())
    }

    pub fn set_candidate_hashes(&mut self, stream_id: &StreamId, num: i64, hashes: &Vec<CryptoHash>) -> Result<(), StreamError> {
        self.0.set(
            &miniblock_key(&variables::CANDIDATE_HASHES, stream_id, num),
            &serialize(hashes, Key::CandidateHashes { stream_id: stream_id.clone(), num })?,
        );
        Ok(())
    }

    /// Delete every candidate stored for miniblock `num`.
    pub fn delete_candidates(&mut self, stream_id: &StreamId, num: i64, hashes: &[CryptoHash]) {
        for hash in hashes {
            self.0.delete(&candidate_key(stream_id, num, hash));
        }
        self.0.delete(&miniblock_key(&variables::CANDIDATE_HASHES, stream_id, num));
    }
}

fn serialize<T: BorshSerialize>(value: &T, key: Key) -> Result<Vec<u8>, StreamError> {
    value.try_to_vec().map_err(|err| StreamError::internal(format!("failed to serialize {}: {}", key, err)))
}
