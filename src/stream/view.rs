/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Immutable, materialized state of one stream.
//!
//! A [`StreamView`] combines a window of recent committed miniblocks, the [`Snapshot`] carried by one of
//! them, and the [`Minipool`] of pending events. Views are never mutated: every transition
//! (`copy_and_add_event`, `copy_and_apply_block`, `copy_and_prepend_miniblocks`) returns a new view and
//! leaves the receiver untouched, so a loaded view can be shared between threads without locking.
//!
//! The window always starts at or before the miniblock carrying the snapshot, at `snapshot_index`. When a
//! miniblock with a new snapshot is applied the window is trimmed to the last `recency_constraints_gen`
//! miniblocks before it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::config::StreamConfig;
use crate::errors::StreamError;
use crate::networking::{ProposeMiniblockRequest, ProposeMiniblockResponse};
use crate::snapshot::{make_snapshot_envelope, update_snapshot};
use crate::storage::ReadStreamFromLastSnapshotResult;
use crate::types::crypto_primitives::Wallet;
use crate::types::data_types::{Address, CryptoHash, MiniblockRef, StreamId};
use crate::types::envelope::{Envelope, ParsedEvent};
use crate::types::miniblock::{next_miniblock_timestamp, Miniblock, MiniblockHeader, MiniblockInfo, MiniblockInfoOpts};
use crate::types::payloads::StreamSettings;
use crate::types::snapshot::Snapshot;

use super::minipool::Minipool;

/// A proposal for the next miniblock of a stream: which pending events it should seal, and whether it
/// should carry a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MbProposal {
    pub new_miniblock_num: i64,
    pub prev_miniblock_hash: CryptoHash,
    pub event_hashes: Vec<CryptoHash>,
    pub should_snapshot: bool,
}

/// Position of a subscriber in a stream. The next sync resumes right after it.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SyncCookie {
    pub node_address: Address,
    pub stream_id: StreamId,
    pub minipool_gen: i64,
    pub prev_miniblock_hash: CryptoHash,
}

/// A batch of stream content delivered to a subscriber or a peer.
///
/// If `sync_reset` is set the receiver must discard what it has and start over from `miniblocks`, whose
/// entry at `snapshot_miniblock_index` carries `snapshot`. Otherwise `events` continue where the previous
/// cookie left off.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StreamAndCookie {
    pub events: Vec<Envelope>,
    pub next_sync_cookie: SyncCookie,
    pub miniblocks: Vec<Miniblock>,
    pub snapshot: Option<Envelope>,
    pub sync_reset: bool,
    pub snapshot_miniblock_index: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamViewStats {
    pub first_miniblock_num: i64,
    pub last_miniblock_num: i64,
    pub events_in_minipool: usize,
    /// Includes one header event per miniblock.
    pub events_in_miniblocks: usize,
    pub snapshots_in_miniblocks: usize,
    pub total_events_ever: i64,
}

#[derive(Clone, Debug)]
pub struct StreamView {
    stream_id: StreamId,
    blocks: Vec<Arc<MiniblockInfo>>,
    snapshot_index: usize,
    snapshot: Arc<Snapshot>,
    minipool: Minipool,
}

impl StreamView {
    /// Build a view from the window read from storage.
    pub fn from_storage(stored: &ReadStreamFromLastSnapshotResult) -> Result<StreamView, StreamError> {
        let first = stored
            .miniblocks
            .first()
            .ok_or_else(|| StreamError::internal("no miniblocks in storage result"))?;

        let mut blocks = Vec::with_capacity(stored.miniblocks.len());
        for (i, descriptor) in stored.miniblocks.iter().enumerate() {
            let opts = MiniblockInfoOpts::new().with_expected_block_number(first.number + i as i64);
            blocks.push(Arc::new(MiniblockInfo::from_descriptor(descriptor, &opts)?));
        }

        let mut events = Vec::with_capacity(stored.minipool_envelopes.len());
        for bytes in &stored.minipool_envelopes {
            let envelope = Envelope::try_from_slice(bytes)
                .map_err(|err| StreamError::bad_event(format!("failed to decode minipool envelope: {}", err)))?;
            events.push(Arc::new(ParsedEvent::parse(envelope)?));
        }

        Self::from_blocks(blocks, events)
    }

    /// Build a view holding just a freshly created genesis miniblock.
    pub fn from_genesis(genesis: Arc<MiniblockInfo>) -> Result<StreamView, StreamError> {
        Self::from_blocks(vec![genesis], Vec::new())
    }

    fn from_blocks(blocks: Vec<Arc<MiniblockInfo>>, pending: Vec<Arc<ParsedEvent>>) -> Result<StreamView, StreamError> {
        let snapshot_index = blocks
            .iter()
            .rposition(|block| block.snapshot().is_some())
            .ok_or_else(|| StreamError::bad_event("no snapshot in loaded miniblocks"))?;
        let snapshot = blocks[snapshot_index].snapshot().cloned().ok_or_else(|| StreamError::internal("snapshot vanished"))?;
        let stream_id = snapshot.inception().0.clone();

        let last = blocks.last().ok_or_else(|| StreamError::internal("no miniblocks"))?;
        let minipool = Minipool::from_events(last.num() + 1, next_event_num_offset(last), pending)?;

        Ok(StreamView { stream_id, blocks, snapshot_index, snapshot, minipool })
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn settings(&self) -> &StreamSettings {
        self.snapshot.inception().1
    }

    pub fn blocks(&self) -> &[Arc<MiniblockInfo>] {
        &self.blocks
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn snapshot_index(&self) -> usize {
        self.snapshot_index
    }

    pub fn minipool(&self) -> &Minipool {
        &self.minipool
    }

    pub fn last_block(&self) -> &Arc<MiniblockInfo> {
        // Views always hold at least the miniblock carrying the snapshot.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn last_block_ref(&self) -> MiniblockRef {
        self.last_block().miniblock_ref
    }

    pub fn last_block_num(&self) -> i64 {
        self.last_block().num()
    }

    /// Number of the next miniblock.
    pub fn generation(&self) -> i64 {
        self.minipool.generation()
    }

    pub fn sync_cookie(&self, node_address: Address) -> SyncCookie {
        SyncCookie {
            node_address,
            stream_id: self.stream_id.clone(),
            minipool_gen: self.minipool.generation(),
            prev_miniblock_hash: self.last_block().hash(),
        }
    }

    /// A copy of this view with `event` added to the minipool.
    pub fn copy_and_add_event(&self, event: Arc<ParsedEvent>) -> Result<StreamView, StreamError> {
        if event.payload().is_miniblock_header() {
            return Err(StreamError::bad_event("block header events must not be added to the minipool"));
        }
        let hash = event.hash;
        let minipool = self
            .minipool
            .try_copy_and_add(event)
            .ok_or_else(|| StreamError::DuplicateEvent { stream_id: self.stream_id.clone(), event: hash })?;
        Ok(StreamView { minipool, ..self.clone() })
    }

    /// Propose the next miniblock from the local minipool, within the configured event limits.
    pub fn local_proposal(&self, cfg: &StreamConfig, force_snapshot: bool) -> MbProposal {
        let (max_events, max_size) = cfg.miniblock_event_limits();
        let mut event_hashes = Vec::new();
        let mut total_size = 0usize;
        for event in self.minipool.events() {
            if event_hashes.len() >= max_events {
                break;
            }
            let size = event.size();
            if !event_hashes.is_empty() && total_size.saturating_add(size) > max_size {
                break;
            }
            total_size = total_size.saturating_add(size);
            event_hashes.push(event.hash);
        }
        MbProposal {
            new_miniblock_num: self.generation(),
            prev_miniblock_hash: self.last_block().hash(),
            event_hashes,
            should_snapshot: force_snapshot || self.should_snapshot(cfg),
        }
    }

    /// Answer a peer's request for this node's proposal. Also returns the pending events the peer said
    /// it does not have.
    pub fn propose_for_remote(
        &self,
        cfg: &StreamConfig,
        request: &ProposeMiniblockRequest,
    ) -> Result<ProposeMiniblockResponse, StreamError> {
        if request.stream_id != self.stream_id {
            return Err(StreamError::invalid_argument(format!(
                "proposal requested for stream {} from view of {}",
                request.stream_id, self.stream_id
            )));
        }
        let generation = self.generation();
        if request.new_miniblock_num > generation {
            return Err(StreamError::MiniblockTooNew {
                stream_id: self.stream_id.clone(),
                requested: request.new_miniblock_num,
                local: generation,
            });
        }
        if request.new_miniblock_num < generation {
            return Err(StreamError::MiniblockTooOld {
                stream_id: self.stream_id.clone(),
                requested: request.new_miniblock_num,
                local: generation,
            });
        }
        let last = self.last_block_ref();
        if request.prev_miniblock_hash != last.hash {
            return Err(StreamError::BadPrevMiniblockHash {
                stream_id: self.stream_id.clone(),
                requested_hash: request.prev_miniblock_hash,
                requested_num: Some(request.new_miniblock_num - 1),
                last,
                reason: "proposal requested on a different chain".to_string(),
            });
        }

        let proposal = MbProposal {
            new_miniblock_num: generation,
            prev_miniblock_hash: last.hash,
            event_hashes: self.minipool.hashes(),
            should_snapshot: request.force_snapshot || self.should_snapshot(cfg),
        };
        let missing_events = self
            .minipool
            .events()
            .iter()
            .filter(|event| !request.local_event_hashes.contains(&event.hash))
            .map(|event| event.envelope.clone())
            .collect();
        Ok(ProposeMiniblockResponse { proposal, missing_events })
    }

    /// Seal the events of `proposal` into a signed candidate miniblock that extends this view.
    pub fn make_miniblock_candidate(
        &self,
        wallet: &Wallet,
        proposal: &MbProposal,
        cfg: &StreamConfig,
    ) -> Result<MiniblockInfo, StreamError> {
        let last = self.last_block();
        if proposal.new_miniblock_num != self.generation() || proposal.prev_miniblock_hash != last.hash() {
            return Err(StreamError::MiniblockTooOld {
                stream_id: self.stream_id.clone(),
                requested: proposal.new_miniblock_num,
                local: self.generation(),
            });
        }

        let mut events = Vec::with_capacity(proposal.event_hashes.len());
        for hash in &proposal.event_hashes {
            let event = self.minipool.get(hash).ok_or_else(|| {
                StreamError::internal(format!("proposed event {} is not in the minipool of {}", hash, self.stream_id))
            })?;
            events.push(ParsedEvent::clone(event));
        }

        let event_num_offset = next_event_num_offset(last);
        let miniblock_num = last.num() + 1;
        let prev_snapshot_miniblock_num = last.latest_snapshot_num();

        let snapshot = if proposal.should_snapshot {
            let mut snapshot = Snapshot::clone(&self.snapshot);
            for block in &self.blocks[self.snapshot_index + 1..] {
                for (j, event) in block.events().iter().enumerate() {
                    let event_num = block.header().event_num_offset + j as i64;
                    if let Err(err) = update_snapshot(&mut snapshot, event, block.num(), event_num) {
                        log::warn!("{}: failed to fold event {} of miniblock {}: {}", self.stream_id, event.hash, block.num(), err);
                    }
                }
            }
            for (i, event) in events.iter().enumerate() {
                if let Err(err) = update_snapshot(&mut snapshot, event, miniblock_num, event_num_offset + i as i64) {
                    log::warn!("{}: failed to fold event {} into candidate: {}", self.stream_id, event.hash, err);
                }
            }
            Some(snapshot)
        } else {
            None
        };

        let (embedded, snapshot_envelope) = match &snapshot {
            Some(snapshot) if cfg.enable_new_snapshot_format => (None, Some(make_snapshot_envelope(wallet, snapshot)?)),
            Some(snapshot) => (Some(snapshot.clone()), None),
            None => (None, None),
        };

        let header = MiniblockHeader {
            miniblock_num,
            prev_miniblock_hash: last.hash(),
            timestamp: next_miniblock_timestamp(last.header().timestamp),
            event_hashes: proposal.event_hashes.clone(),
            snapshot: embedded,
            snapshot_hash: snapshot_envelope.as_ref().map(|envelope| envelope.hash),
            event_num_offset,
            prev_snapshot_miniblock_num,
        };
        MiniblockInfo::from_header_and_parsed(wallet, header, events, snapshot_envelope, snapshot)
    }

    /// A copy of this view with `miniblock` appended and its events removed from the minipool. Also returns
    /// the envelopes of events in `miniblock` that were not pending here.
    pub fn copy_and_apply_block(
        &self,
        miniblock: Arc<MiniblockInfo>,
        cfg: &StreamConfig,
    ) -> Result<(StreamView, Vec<Envelope>), StreamError> {
        let last = self.last_block();
        if miniblock.num() != last.num() + 1 {
            return Err(StreamError::bad_block(format!(
                "{}: expected miniblock {} but got {}",
                self.stream_id,
                last.num() + 1,
                miniblock.num()
            )));
        }
        if miniblock.header().prev_miniblock_hash != last.hash() {
            return Err(StreamError::bad_block(format!(
                "{}: miniblock {} has prev hash {} but last miniblock is {}",
                self.stream_id,
                miniblock.num(),
                miniblock.header().prev_miniblock_hash,
                last.hash()
            )));
        }

        let (minipool, new_hashes) = self.minipool.copy_without(
            &miniblock.header().event_hashes,
            miniblock.num() + 1,
            next_event_num_offset(&miniblock),
        );
        let new_events = miniblock
            .events()
            .iter()
            .filter(|event| new_hashes.contains(&event.hash))
            .map(|event| event.envelope.clone())
            .collect();

        let (blocks, snapshot_index, snapshot) = match miniblock.snapshot() {
            Some(snapshot) => {
                let keep = cfg.recency_constraints_gen.max(0) as usize;
                let start_index = self.blocks.len().saturating_sub(keep);
                let mut blocks = self.blocks[start_index..].to_vec();
                let snapshot_index = blocks.len();
                blocks.push(miniblock.clone());
                (blocks, snapshot_index, snapshot.clone())
            }
            None => {
                let mut blocks = self.blocks.clone();
                blocks.push(miniblock.clone());
                (blocks, self.snapshot_index, self.snapshot.clone())
            }
        };

        Ok((StreamView { stream_id: self.stream_id.clone(), blocks, snapshot_index, snapshot, minipool }, new_events))
    }

    /// A copy of this view with `miniblocks`, which must directly precede the window, added in front.
    pub fn copy_and_prepend_miniblocks(&self, miniblocks: &[Arc<MiniblockInfo>]) -> Result<StreamView, StreamError> {
        if miniblocks.is_empty() {
            return Ok(self.clone());
        }
        for pair in miniblocks.windows(2) {
            if pair[1].num() != pair[0].num() + 1 {
                return Err(StreamError::invalid_argument(format!(
                    "miniblocks to prepend are not sequential: {} then {}",
                    pair[0].num(),
                    pair[1].num()
                )));
            }
        }
        let first = self.blocks[0].num();
        let last_prepended = miniblocks[miniblocks.len() - 1].num();
        if last_prepended + 1 != first {
            return Err(StreamError::invalid_argument(format!(
                "miniblocks to prepend end at {} but the view starts at {}",
                last_prepended, first
            )));
        }
        let mut blocks = miniblocks.to_vec();
        blocks.extend(self.blocks.iter().cloned());
        Ok(StreamView {
            blocks,
            snapshot_index: self.snapshot_index + miniblocks.len(),
            ..self.clone()
        })
    }

    pub fn index_of_miniblock_with_num(&self, num: i64) -> Result<usize, StreamError> {
        let first = self.blocks[0].num();
        let last = self.last_block_num();
        if num < first || num > last {
            return Err(StreamError::invalid_argument(format!(
                "{}: miniblock {} is not in the view [{}, {}]",
                self.stream_id, num, first, last
            )));
        }
        Ok((num - first) as usize)
    }

    pub fn block_with_num(&self, num: i64) -> Result<&Arc<MiniblockInfo>, StreamError> {
        Ok(&self.blocks[self.index_of_miniblock_with_num(num)?])
    }

    /// Visit the events of the blocks from `start_block` on, then the minipool. Stops early when `op`
    /// returns `false`.
    pub fn for_each_event<F>(&self, start_block: usize, op: &mut F) -> Result<(), StreamError>
    where
        F: FnMut(&ParsedEvent, i64, i64) -> Result<bool, StreamError>,
    {
        for block in self.blocks.iter().skip(start_block) {
            if !block.for_each_event(op)? {
                return Ok(());
            }
        }
        self.minipool.for_each_event(op)?;
        Ok(())
    }

    /// The last event of the stream, pending or committed.
    pub fn last_event(&self) -> Option<&ParsedEvent> {
        if let Some(event) = self.minipool.last_event() {
            return Some(event);
        }
        self.blocks.iter().rev().find_map(|block| block.last_event())
    }

    /// True once the events since the last snapshot reach the per-type threshold.
    pub fn should_snapshot(&self, cfg: &StreamConfig) -> bool {
        let threshold = cfg.min_snapshot_events.for_type(self.stream_id.stream_type());
        let mut count = self.minipool.len();
        for block in self.blocks.iter().rev() {
            if block.has_snapshot() {
                break;
            }
            count += block.events().len();
        }
        count >= threshold
    }

    /// Check that `event` may be added: its predecessor is known and recent, and it is not a duplicate.
    /// Recency is only checked when `now` is given.
    pub fn validate_next_event(
        &self,
        cfg: &StreamConfig,
        event: &ParsedEvent,
        now: Option<SystemTime>,
    ) -> Result<(), StreamError> {
        let last = self.last_block_ref();
        let prev_hash = event.prev_miniblock_hash().unwrap_or_else(CryptoHash::zero);

        let found_at = match event.prev_miniblock_num() {
            Some(num) if num >= 0 => {
                if num > last.num {
                    return Err(StreamError::MiniblockTooNew {
                        stream_id: self.stream_id.clone(),
                        requested: num,
                        local: last.num,
                    });
                }
                let first = self.blocks[0].num();
                if num < first {
                    return Err(StreamError::BadPrevMiniblockHash {
                        stream_id: self.stream_id.clone(),
                        requested_hash: prev_hash,
                        requested_num: Some(num),
                        last,
                        reason: format!("miniblock {} is older than the first retained miniblock {}", num, first),
                    });
                }
                let index = (num - first) as usize;
                if self.blocks[index].hash() != prev_hash {
                    return Err(StreamError::DataLoss {
                        reason: format!(
                            "{}: event {} references miniblock {} with hash {} but it is {}",
                            self.stream_id,
                            event.hash,
                            num,
                            prev_hash,
                            self.blocks[index].hash()
                        ),
                    });
                }
                index
            }
            _ => self.blocks.iter().rposition(|block| block.hash() == prev_hash).ok_or_else(|| {
                StreamError::BadPrevMiniblockHash {
                    stream_id: self.stream_id.clone(),
                    requested_hash: prev_hash,
                    requested_num: None,
                    last,
                    reason: "prev miniblock not found in recent miniblocks".to_string(),
                }
            })?,
        };

        if let Some(now) = now {
            if found_at + 1 < self.blocks.len() {
                let next_timestamp = self.blocks[found_at + 1].header().timestamp;
                let now_nanos = now.duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as i64).unwrap_or_default();
                let age = now_nanos.saturating_sub(next_timestamp);
                if age > cfg.recency_constraints_age.as_nanos() as i64 {
                    return Err(StreamError::BadPrevMiniblockHash {
                        stream_id: self.stream_id.clone(),
                        requested_hash: prev_hash,
                        requested_num: Some(self.blocks[found_at].num()),
                        last,
                        reason: format!("prev miniblock was superseded {} ms ago", age / 1_000_000),
                    });
                }
            }
        }

        let duplicate = self.blocks[found_at + 1..]
            .iter()
            .any(|block| block.header().event_hashes.contains(&event.hash))
            || self.minipool.contains(&event.hash);
        if duplicate {
            return Err(StreamError::DuplicateEvent { stream_id: self.stream_id.clone(), event: event.hash });
        }
        Ok(())
    }

    pub fn get_stats(&self) -> StreamViewStats {
        let mut stats = StreamViewStats {
            first_miniblock_num: self.blocks[0].num(),
            last_miniblock_num: self.last_block_num(),
            events_in_minipool: self.minipool.len(),
            ..Default::default()
        };
        for block in &self.blocks {
            stats.events_in_miniblocks += block.events().len() + 1;
            if block.has_snapshot() {
                stats.snapshots_in_miniblocks += 1;
            }
        }
        let mut total = self.blocks[self.snapshot_index].header().event_num_offset;
        for block in &self.blocks[self.snapshot_index..] {
            total += block.events().len() as i64 + 1;
        }
        stats.total_events_ever = total + self.minipool.len() as i64;
        stats
    }

    /// What a subscriber at `cookie` has missed, or a reset if the cookie is too old for this view.
    pub fn get_stream_since(&self, node_address: Address, cookie: &SyncCookie) -> Result<StreamAndCookie, StreamError> {
        if cookie.minipool_gen == self.generation() {
            if cookie.prev_miniblock_hash != self.last_block().hash() {
                return Ok(self.get_reset_stream_and_cookie(node_address));
            }
            return Ok(StreamAndCookie {
                events: self.minipool.events().iter().map(|event| event.envelope.clone()).collect(),
                next_sync_cookie: self.sync_cookie(node_address),
                miniblocks: Vec::new(),
                snapshot: None,
                sync_reset: false,
                snapshot_miniblock_index: 0,
            });
        }

        let index = match self.index_of_miniblock_with_num(cookie.minipool_gen) {
            Ok(index) if index > self.snapshot_index => index,
            _ => return Ok(self.get_reset_stream_and_cookie(node_address)),
        };
        if self.blocks[index - 1].hash() != cookie.prev_miniblock_hash {
            return Ok(self.get_reset_stream_and_cookie(node_address));
        }

        let mut events = Vec::new();
        self.for_each_event(index, &mut |event, _, _| {
            events.push(event.envelope.clone());
            Ok(true)
        })?;
        Ok(StreamAndCookie {
            events,
            next_sync_cookie: self.sync_cookie(node_address),
            miniblocks: Vec::new(),
            snapshot: None,
            sync_reset: false,
            snapshot_miniblock_index: 0,
        })
    }

    /// Everything a subscriber needs to start over: miniblocks from the last snapshot and the minipool.
    pub fn get_reset_stream_and_cookie(&self, node_address: Address) -> StreamAndCookie {
        self.get_stream_with_preceding(node_address, 0)
    }

    /// Like [`get_reset_stream_and_cookie`](Self::get_reset_stream_and_cookie), but also includes up to
    /// `num_preceding` miniblocks before the one carrying the snapshot.
    pub fn get_stream_with_preceding(&self, node_address: Address, num_preceding: usize) -> StreamAndCookie {
        let start = self.snapshot_index.saturating_sub(num_preceding);
        StreamAndCookie {
            events: self.minipool.events().iter().map(|event| event.envelope.clone()).collect(),
            next_sync_cookie: self.sync_cookie(node_address),
            miniblocks: self.blocks[start..].iter().map(|block| block.miniblock.clone()).collect(),
            snapshot: self.blocks[self.snapshot_index].snapshot_envelope.clone(),
            sync_reset: true,
            snapshot_miniblock_index: self.snapshot_index - start,
        }
    }
}

/// Event number the first event after `block` receives. The header event takes one number.
fn next_event_num_offset(block: &MiniblockInfo) -> i64 {
    block.header().event_num_offset + block.events().len() as i64 + 1
}
