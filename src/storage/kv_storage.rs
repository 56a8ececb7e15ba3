/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [`StreamStorage`] on top of a user-provided [`KVStore`].
//!
//! All operations take the store's lock, read what they need through [`KVGet`], check their preconditions,
//! and then apply every write in a single [`StreamWriteBatch`]. A failed precondition leaves the store
//! untouched.

use std::sync::Mutex;

use crate::errors::StreamError;
use crate::types::data_types::{CryptoHash, StreamId};

use super::pluggables::{KVGet, KVStore, StoredMinipool, StreamMeta};
use super::write_batch::StreamWriteBatch;
use super::{MiniblockDescriptor, MiniblockRange, ReadStreamFromLastSnapshotResult, StreamStorage};

pub struct KVStreamStorage<K: KVStore> {
    store: Mutex<K>,
}

impl<K: KVStore> KVStreamStorage<K> {
    pub fn new(store: K) -> KVStreamStorage<K> {
        KVStreamStorage { store: Mutex::new(store) }
    }

    fn meta(store: &K, stream_id: &StreamId) -> Result<StreamMeta, StreamError> {
        store
            .stream_meta(stream_id)?
            .ok_or_else(|| StreamError::not_found(format!("stream {}", stream_id)))
    }

    fn create(&self, stream_id: &StreamId, genesis: &MiniblockDescriptor, is_ephemeral: bool) -> Result<(), StreamError> {
        if genesis.number != 0 {
            return Err(StreamError::invalid_argument(format!("genesis miniblock has number {}", genesis.number)));
        }
        let mut store = self.store.lock().unwrap();
        if store.stream_meta(stream_id)?.is_some() {
            return Err(StreamError::AlreadyExists { what: format!("stream {}", stream_id) });
        }

        let mut meta = StreamMeta { is_ephemeral, ..Default::default() };
        meta.add_range(0, 0);
        if genesis.has_snapshot {
            meta.add_snapshot_num(0);
        }

        let mut wb = StreamWriteBatch::new();
        wb.set_miniblock(stream_id, genesis)?;
        wb.set_minipool(stream_id, &StoredMinipool { generation: 1, envelopes: Vec::new() })?;
        wb.set_stream_meta(stream_id, &meta)?;
        store.write(wb.0);
        Ok(())
    }

    fn check_contiguous(stream_id: &StreamId, miniblocks: &[MiniblockDescriptor]) -> Result<(), StreamError> {
        for pair in miniblocks.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(StreamError::invalid_argument(format!(
                    "miniblocks of stream {} are not contiguous: {} follows {}",
                    stream_id, pair[1].number, pair[0].number
                )));
            }
        }
        Ok(())
    }

    /// Drop candidates for miniblocks up to `last_num`, which are now either applied or stale.
    fn prune_candidates<W: super::write_batch::WriteBatch>(
        store: &K,
        wb: &mut StreamWriteBatch<W>,
        stream_id: &StreamId,
        meta: &mut StreamMeta,
        last_num: i64,
    ) -> Result<(), StreamError> {
        let (stale, kept): (Vec<i64>, Vec<i64>) = meta.candidate_nums.iter().partition(|num| **num <= last_num);
        for num in stale {
            let hashes = store.candidate_hashes(stream_id, num)?;
            wb.delete_candidates(stream_id, num, &hashes);
        }
        meta.candidate_nums = kept;
        Ok(())
    }
}

impl<K: KVStore> StreamStorage for KVStreamStorage<K> {
    fn create_stream_storage(&self, stream_id: &StreamId, genesis: &MiniblockDescriptor) -> Result<(), StreamError> {
        self.create(stream_id, genesis, false)
    }

    fn create_ephemeral_stream_storage(&self, stream_id: &StreamId, genesis: &MiniblockDescriptor) -> Result<(), StreamError> {
        self.create(stream_id, genesis, true)
    }

    fn read_stream_from_last_snapshot(
        &self,
        stream_id: &StreamId,
        num_preceding_miniblocks: i64,
    ) -> Result<ReadStreamFromLastSnapshotResult, StreamError> {
        let store = self.store.lock().unwrap();
        let meta = Self::meta(&store, stream_id)?;
        if meta.is_ephemeral {
            return Err(StreamError::not_found(format!("stream {} is ephemeral", stream_id)));
        }
        let (range_start, last) = *meta
            .ranges
            .last()
            .ok_or_else(|| StreamError::not_found(format!("miniblocks of stream {}", stream_id)))?;

        let snapshot_num = meta
            .snapshot_nums
            .iter()
            .rev()
            .find(|num| **num >= range_start && **num <= last)
            .copied()
            .ok_or_else(|| StreamError::DataLoss { reason: format!("no snapshot in the last range of stream {}", stream_id) })?;
        let start = (snapshot_num - num_preceding_miniblocks.max(0)).max(range_start);

        let mut miniblocks = Vec::with_capacity((last - start + 1) as usize);
        for num in start..=last {
            let miniblock = store.miniblock(stream_id, num)?.ok_or_else(|| StreamError::DataLoss {
                reason: format!("miniblock {} of stream {} is missing", num, stream_id),
            })?;
            miniblocks.push(miniblock);
        }

        let minipool = store.minipool(stream_id)?;
        if minipool.generation != last + 1 {
            return Err(StreamError::internal(format!(
                "minipool generation {} of stream {} does not follow last miniblock {}",
                minipool.generation, stream_id, last
            )));
        }

        Ok(ReadStreamFromLastSnapshotResult {
            snapshot_miniblock_offset: (snapshot_num - start) as usize,
            miniblocks,
            minipool_envelopes: minipool.envelopes,
        })
    }

    fn read_miniblocks(
        &self,
        stream_id: &StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<MiniblockDescriptor>, StreamError> {
        let store = self.store.lock().unwrap();
        Self::meta(&store, stream_id)?;
        let mut miniblocks = Vec::new();
        for num in from_inclusive.max(0)..to_exclusive {
            match store.miniblock(stream_id, num)? {
                Some(miniblock) => miniblocks.push(miniblock),
                None => break,
            }
        }
        Ok(miniblocks)
    }

    fn read_miniblocks_by_ids(&self, stream_id: &StreamId, nums: &[i64]) -> Result<Vec<MiniblockDescriptor>, StreamError> {
        let store = self.store.lock().unwrap();
        Self::meta(&store, stream_id)?;
        let mut miniblocks = Vec::with_capacity(nums.len());
        for num in nums {
            if let Some(miniblock) = store.miniblock(stream_id, *num)? {
                miniblocks.push(miniblock);
            }
        }
        Ok(miniblocks)
    }

    fn write_event(
        &self,
        stream_id: &StreamId,
        minipool_generation: i64,
        minipool_slot: usize,
        envelope: &[u8],
    ) -> Result<(), StreamError> {
        let mut store = self.store.lock().unwrap();
        Self::meta(&store, stream_id)?;
        let mut minipool = store.minipool(stream_id)?;
        if minipool.generation != minipool_generation || minipool.envelopes.len() != minipool_slot {
            return Err(StreamError::internal(format!(
                "minipool of stream {} is at generation {} slot {}, write expected generation {} slot {}",
                stream_id,
                minipool.generation,
                minipool.envelopes.len(),
                minipool_generation,
                minipool_slot
            )));
        }
        minipool.envelopes.push(envelope.to_vec());

        let mut wb = StreamWriteBatch::new();
        wb.set_minipool(stream_id, &minipool)?;
        store.write(wb.0);
        Ok(())
    }

    fn write_miniblocks(
        &self,
        stream_id: &StreamId,
        miniblocks: &[MiniblockDescriptor],
        new_minipool_generation: i64,
        new_minipool: Vec<Vec<u8>>,
        prev_minipool_generation: i64,
        prev_minipool_size: usize,
    ) -> Result<(), StreamError> {
        let (first, last) = match (miniblocks.first(), miniblocks.last()) {
            (Some(first), Some(last)) => (first.number, last.number),
            _ => return Err(StreamError::invalid_argument("no miniblocks to write")),
        };
        Self::check_contiguous(stream_id, miniblocks)?;
        if last + 1 != new_minipool_generation {
            return Err(StreamError::invalid_argument(format!(
                "new minipool generation {} does not follow last miniblock {}",
                new_minipool_generation, last
            )));
        }

        let mut store = self.store.lock().unwrap();
        let mut meta = Self::meta(&store, stream_id)?;
        let minipool = store.minipool(stream_id)?;
        if minipool.generation != prev_minipool_generation || minipool.envelopes.len() != prev_minipool_size {
            return Err(StreamError::internal(format!(
                "minipool of stream {} is at generation {} with {} events, expected generation {} with {}",
                stream_id,
                minipool.generation,
                minipool.envelopes.len(),
                prev_minipool_generation,
                prev_minipool_size
            )));
        }
        if meta.last_miniblock_num().map(|num| num + 1) != Some(first) {
            return Err(StreamError::internal(format!(
                "miniblock {} does not follow last stored miniblock {:?} of stream {}",
                first,
                meta.last_miniblock_num(),
                stream_id
            )));
        }

        let mut wb = StreamWriteBatch::new();
        for miniblock in miniblocks {
            wb.set_miniblock(stream_id, miniblock)?;
            if miniblock.has_snapshot {
                meta.add_snapshot_num(miniblock.number);
            }
        }
        meta.add_range(first, last);
        Self::prune_candidates(&store, &mut wb, stream_id, &mut meta, last)?;
        wb.set_minipool(stream_id, &StoredMinipool { generation: new_minipool_generation, envelopes: new_minipool })?;
        wb.set_stream_meta(stream_id, &meta)?;
        store.write(wb.0);
        Ok(())
    }

    fn write_miniblock_candidate(&self, stream_id: &StreamId, candidate: &MiniblockDescriptor) -> Result<(), StreamError> {
        let mut store = self.store.lock().unwrap();
        let mut meta = Self::meta(&store, stream_id)?;
        if let Some(last) = meta.last_miniblock_num() {
            if candidate.number <= last {
                return Err(StreamError::MiniblockTooOld { stream_id: stream_id.clone(), requested: candidate.number, local: last + 1 });
            }
        }

        let mut hashes = store.candidate_hashes(stream_id, candidate.number)?;
        if !hashes.contains(&candidate.hash) {
            hashes.push(candidate.hash);
        }
        meta.add_candidate_num(candidate.number);

        let mut wb = StreamWriteBatch::new();
        wb.set_candidate(stream_id, candidate)?;
        wb.set_candidate_hashes(stream_id, candidate.number, &hashes)?;
        wb.set_stream_meta(stream_id, &meta)?;
        store.write(wb.0);
        Ok(())
    }

    fn read_miniblock_candidate(
        &self,
        stream_id: &StreamId,
        hash: &CryptoHash,
        num: i64,
    ) -> Result<MiniblockDescriptor, StreamError> {
        let store = self.store.lock().unwrap();
        store
            .candidate(stream_id, num, hash)?
            .ok_or_else(|| StreamError::not_found(format!("candidate {} at {} of stream {}", hash, num, stream_id)))
    }

    fn get_miniblock_candidate_count(&self, stream_id: &StreamId, num: i64) -> Result<usize, StreamError> {
        let store = self.store.lock().unwrap();
        Ok(store.candidate_hashes(stream_id, num)?.len())
    }

    fn get_miniblock_number_ranges(&self, stream_id: &StreamId, start_inclusive: i64) -> Result<Vec<MiniblockRange>, StreamError> {
        let store = self.store.lock().unwrap();
        let meta = Self::meta(&store, stream_id)?;
        Ok(meta
            .ranges
            .iter()
            .filter(|(_, end)| *end >= start_inclusive)
            .map(|(start, end)| {
                let start = (*start).max(start_inclusive);
                MiniblockRange {
                    start_inclusive: start,
                    end_inclusive: *end,
                    snapshot_seq_nums: meta.snapshot_nums.iter().filter(|num| **num >= start && **num <= *end).copied().collect(),
                }
            })
            .collect())
    }

    fn get_last_miniblock_number(&self, stream_id: &StreamId) -> Result<i64, StreamError> {
        let store = self.store.lock().unwrap();
        Self::meta(&store, stream_id)?
            .last_miniblock_num()
            .ok_or_else(|| StreamError::not_found(format!("miniblocks of stream {}", stream_id)))
    }

    fn reinitialize_stream_storage(
        &self,
        stream_id: &StreamId,
        miniblocks: &[MiniblockDescriptor],
        last_snapshot_num: i64,
        update_existing: bool,
    ) -> Result<(), StreamError> {
        let (first, last) = match (miniblocks.first(), miniblocks.last()) {
            (Some(first), Some(last)) => (first.number, last.number),
            _ => return Err(StreamError::invalid_argument("no miniblocks to reinitialize from")),
        };
        Self::check_contiguous(stream_id, miniblocks)?;
        if last_snapshot_num < first || last_snapshot_num > last {
            return Err(StreamError::invalid_argument(format!(
                "snapshot miniblock {} is outside of [{}, {}]",
                last_snapshot_num, first, last
            )));
        }

        let mut store = self.store.lock().unwrap();
        let mut meta = match (store.stream_meta(stream_id)?, update_existing) {
            (Some(_), false) => return Err(StreamError::AlreadyExists { what: format!("stream {}", stream_id) }),
            (None, true) => return Err(StreamError::not_found(format!("stream {}", stream_id))),
            (Some(meta), true) => meta,
            (None, false) => StreamMeta::default(),
        };
        if let Some(existing_last) = meta.last_miniblock_num() {
            if last < existing_last {
                return Err(StreamError::invalid_argument(format!(
                    "stream {} already has miniblock {}, reinitialize only reaches {}",
                    stream_id, existing_last, last
                )));
            }
        }

        let mut wb = StreamWriteBatch::new();
        for miniblock in miniblocks {
            wb.set_miniblock(stream_id, miniblock)?;
            if miniblock.has_snapshot {
                meta.add_snapshot_num(miniblock.number);
            }
        }
        meta.add_snapshot_num(last_snapshot_num);
        meta.add_range(first, last);
        meta.is_ephemeral = false;
        Self::prune_candidates(&store, &mut wb, stream_id, &mut meta, last)?;
        wb.set_minipool(stream_id, &StoredMinipool { generation: last + 1, envelopes: Vec::new() })?;
        wb.set_stream_meta(stream_id, &meta)?;
        store.write(wb.0);
        Ok(())
    }

    fn write_preceding_miniblocks(&self, stream_id: &StreamId, miniblocks: &[MiniblockDescriptor]) -> Result<(), StreamError> {
        let (first, last) = match (miniblocks.first(), miniblocks.last()) {
            (Some(first), Some(last)) => (first.number, last.number),
            _ => return Ok(()),
        };
        Self::check_contiguous(stream_id, miniblocks)?;

        let mut store = self.store.lock().unwrap();
        let mut meta = Self::meta(&store, stream_id)?;
        match meta.last_miniblock_num() {
            Some(existing_last) if last < existing_last => {}
            _ => {
                return Err(StreamError::invalid_argument(format!(
                    "preceding miniblocks [{}, {}] of stream {} must end before the last stored miniblock",
                    first, last, stream_id
                )))
            }
        }

        let mut wb = StreamWriteBatch::new();
        for miniblock in miniblocks.iter().filter(|miniblock| !meta.contains(miniblock.number)) {
            wb.set_miniblock(stream_id, miniblock)?;
        }
        for miniblock in miniblocks {
            if miniblock.has_snapshot {
                meta.add_snapshot_num(miniblock.number);
            }
        }
        meta.add_range(first, last);
        wb.set_stream_meta(stream_id, &meta)?;
        store.write(wb.0);
        Ok(())
    }

    fn write_ephemeral_miniblock(&self, stream_id: &StreamId, miniblock: &MiniblockDescriptor) -> Result<(), StreamError> {
        let mut store = self.store.lock().unwrap();
        let mut meta = Self::meta(&store, stream_id)?;
        if !meta.is_ephemeral {
            return Err(StreamError::internal(format!("stream {} is not ephemeral", stream_id)));
        }

        let mut wb = StreamWriteBatch::new();
        wb.set_miniblock(stream_id, miniblock)?;
        if miniblock.has_snapshot {
            meta.add_snapshot_num(miniblock.number);
        }
        meta.add_range(miniblock.number, miniblock.number);
        wb.set_stream_meta(stream_id, &meta)?;
        store.write(wb.0);
        Ok(())
    }

    fn normalize_ephemeral_stream(&self, stream_id: &StreamId) -> Result<CryptoHash, StreamError> {
        let mut store = self.store.lock().unwrap();
        let mut meta = Self::meta(&store, stream_id)?;
        let last = match meta.ranges.as_slice() {
            [(0, last)] => *last,
            _ => {
                return Err(StreamError::internal(format!(
                    "ephemeral stream {} has gaps: {:?}",
                    stream_id, meta.ranges
                )))
            }
        };
        let last_miniblock = store
            .miniblock(stream_id, last)?
            .ok_or_else(|| StreamError::DataLoss { reason: format!("miniblock {} of stream {} is missing", last, stream_id) })?;
        if !meta.is_ephemeral {
            return Ok(last_miniblock.hash);
        }

        meta.is_ephemeral = false;
        let mut wb = StreamWriteBatch::new();
        wb.set_minipool(stream_id, &StoredMinipool { generation: last + 1, envelopes: Vec::new() })?;
        wb.set_stream_meta(stream_id, &meta)?;
        store.write(wb.0);
        Ok(last_miniblock.hash)
    }

    fn is_stream_ephemeral(&self, stream_id: &StreamId) -> Result<bool, StreamError> {
        let store = self.store.lock().unwrap();
        Ok(Self::meta(&store, stream_id)?.is_ephemeral)
    }
}
