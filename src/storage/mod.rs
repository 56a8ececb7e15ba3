/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable storage of streams.
//!
//! [`StreamStorage`] is the interface the rest of the crate consumes. Implementations must report a missing
//! stream or miniblock as [`StreamError::NotFound`] and a stream that already exists as
//! [`StreamError::AlreadyExists`], distinctly from other failures.
//!
//! [`kv_storage::KVStreamStorage`] implements `StreamStorage` on top of any user-provided
//! [key-value store](pluggables::KVStore).

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::StreamError;
use crate::types::data_types::{CryptoHash, StreamId};

pub mod pluggables;

pub mod variables;

pub mod write_batch;

pub mod kv_storage;

/// A serialized miniblock, as written to and read from storage.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MiniblockDescriptor {
    pub number: i64,
    pub hash: CryptoHash,
    /// Borsh bytes of the [`Miniblock`](crate::types::miniblock::Miniblock).
    pub data: Vec<u8>,
    /// Borsh bytes of the detached snapshot envelope. Empty if there is none.
    pub snapshot_envelope: Vec<u8>,
    pub has_snapshot: bool,
}

/// Contiguous range of miniblock numbers present in storage.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MiniblockRange {
    pub start_inclusive: i64,
    pub end_inclusive: i64,
    /// Numbers of the miniblocks in this range that carry a snapshot.
    pub snapshot_seq_nums: Vec<i64>,
}

/// The window of a stream needed to build its view.
#[derive(Clone, Debug)]
pub struct ReadStreamFromLastSnapshotResult {
    /// Index in `miniblocks` of the miniblock that carries the last snapshot.
    pub snapshot_miniblock_offset: usize,
    pub miniblocks: Vec<MiniblockDescriptor>,
    pub minipool_envelopes: Vec<Vec<u8>>,
}

pub trait StreamStorage: Send + Sync + 'static {
    /// Create a stream with its genesis miniblock. Fails with `AlreadyExists` if the stream exists.
    fn create_stream_storage(&self, stream_id: &StreamId, genesis: &MiniblockDescriptor) -> Result<(), StreamError>;

    /// Create a stream whose miniblocks are written out of order until it is normalized.
    fn create_ephemeral_stream_storage(&self, stream_id: &StreamId, genesis: &MiniblockDescriptor) -> Result<(), StreamError>;

    /// Read the miniblocks from the last snapshot, plus up to `num_preceding_miniblocks` before it, and the
    /// minipool.
    fn read_stream_from_last_snapshot(
        &self,
        stream_id: &StreamId,
        num_preceding_miniblocks: i64,
    ) -> Result<ReadStreamFromLastSnapshotResult, StreamError>;

    /// Read the contiguous run of miniblocks starting at `from_inclusive`, stopping before `to_exclusive` or
    /// at the first missing miniblock.
    fn read_miniblocks(
        &self,
        stream_id: &StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<MiniblockDescriptor>, StreamError>;

    /// Read specific miniblocks. Missing numbers are skipped.
    fn read_miniblocks_by_ids(&self, stream_id: &StreamId, nums: &[i64]) -> Result<Vec<MiniblockDescriptor>, StreamError>;

    /// Append an event to the minipool of generation `minipool_generation` at `minipool_slot`.
    fn write_event(
        &self,
        stream_id: &StreamId,
        minipool_generation: i64,
        minipool_slot: usize,
        envelope: &[u8],
    ) -> Result<(), StreamError>;

    /// Append `miniblocks` and replace the minipool, if the stored minipool still is generation
    /// `prev_minipool_generation` with `prev_minipool_size` events.
    fn write_miniblocks(
        &self,
        stream_id: &StreamId,
        miniblocks: &[MiniblockDescriptor],
        new_minipool_generation: i64,
        new_minipool: Vec<Vec<u8>>,
        prev_minipool_generation: i64,
        prev_minipool_size: usize,
    ) -> Result<(), StreamError>;

    fn write_miniblock_candidate(&self, stream_id: &StreamId, candidate: &MiniblockDescriptor) -> Result<(), StreamError>;

    fn read_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        hash: &CryptoHash,
        num: i64,
    ) -> Result<MiniblockDescriptor, StreamError>;

    /// Number of distinct candidates stored for miniblock `num`.
    fn get_miniblock_candidate_count(&self, stream_id: &StreamId, num: i64) -> Result<usize, StreamError>;

    /// Ranges of stored miniblocks at or after `start_inclusive`, in ascending order.
    fn get_miniblock_number_ranges(&self, stream_id: &StreamId, start_inclusive: i64) -> Result<Vec<MiniblockRange>, StreamError>;

    fn get_last_miniblock_number(&self, stream_id: &StreamId) -> Result<i64, StreamError>;

    /// Replace the tail of a stream with `miniblocks`, which must be contiguous and include the miniblock
    /// carrying the snapshot `last_snapshot_num`. Creates the stream unless `update_existing`.
    fn reinitialize_stream_storage(
        &self,
        stream_id: &StreamId,
        miniblocks: &[MiniblockDescriptor],
        last_snapshot_num: i64,
        update_existing: bool,
    ) -> Result<(), StreamError>;

    /// Fill a gap before the last stored miniblock. Miniblocks that are already present are skipped.
    fn write_preceding_miniblocks(&self, stream_id: &StreamId, miniblocks: &[MiniblockDescriptor]) -> Result<(), StreamError>;

    fn write_ephemeral_miniblock(&self, stream_id: &StreamId, miniblock: &MiniblockDescriptor) -> Result<(), StreamError>;

    /// Seal an ephemeral stream once every miniblock is present. Returns the hash of its last miniblock.
    fn normalize_ephemeral_stream(&self, stream_id: &StreamId) -> Result<CryptoHash, StreamError>;

    fn is_stream_ephemeral(&self, stream_id: &StreamId) -> Result<bool, StreamError>;
}
