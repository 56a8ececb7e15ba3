/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bringing one stream's local storage up to the registry's last miniblock.
//!
//! A [`StreamReconciler`] compares the miniblock ranges in local storage with the registry record and picks
//! one of the following, in order:
//! 1. A sealed stream whose storage is ephemeral is completed from peers and normalized.
//! 2. A stream one miniblock behind tries to promote the candidate it already stores.
//! 3. A stream with nothing beyond genesis in the registry is created from the registry's genesis.
//! 4. A small gap is fetched forward, page by page, from the last local miniblock.
//! 5. A large gap, or a stream with no local storage, is reinitialized from a peer's last snapshot and
//!    then fetched forward if the peer was behind.
//!
//! Afterwards, if backwards reconciliation is enabled, gaps in the retained history window are backfilled
//! from the newest to the oldest.

use std::sync::Arc;
use std::time::SystemTime;

use crate::context::Context;
use crate::errors::StreamError;
use crate::events::{EndReconcileEvent, Event, StartReconcileEvent};
use crate::networking::MiniblockWithSnapshot;
use crate::storage::MiniblockRange;
use crate::stream::Stream;
use crate::stream_cache::StreamCache;
use crate::types::miniblock::{MiniblockInfo, MiniblockInfoOpts};
use crate::types::stream_record::StreamRecord;

use super::ranges::{calculate_missing_ranges, find_closest_snapshot_miniblock};
use super::remote_tracker::RemoteTracker;

/// What one reconciliation did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub forward_miniblocks: usize,
    pub backward_reinitialized: bool,
    pub backfill_miniblocks: usize,
}

pub(crate) struct StreamReconciler<'a> {
    cache: &'a StreamCache,
    ctx: &'a Context,
    stream: Arc<Stream>,
    record: StreamRecord,
    remotes: RemoteTracker,
    expected_last: i64,
    /// Last miniblock in local storage, -1 if there is none.
    local_last: i64,
    not_found: bool,
    present: Vec<MiniblockRange>,
    stats: ReconcilerStats,
}

impl<'a> StreamReconciler<'a> {
    pub(crate) fn new(cache: &'a StreamCache, ctx: &'a Context, stream: Arc<Stream>, record: StreamRecord) -> StreamReconciler<'a> {
        // The stream may have been loaded before its latest placement update.
        stream.reset_nodes(&record);
        let (remotes, _) = stream.get_remotes_and_is_local();
        let remotes = RemoteTracker::new(stream.get_sticky_peer(), remotes);
        let expected_last = record.last_miniblock_num;
        StreamReconciler {
            cache,
            ctx,
            stream,
            record,
            remotes,
            expected_last,
            local_last: -1,
            not_found: true,
            present: Vec::new(),
            stats: ReconcilerStats::default(),
        }
    }

    pub(crate) fn reconcile(mut self) -> Result<ReconcilerStats, StreamError> {
        Event::publish(
            &self.cache.params.event_publisher,
            Event::StartReconcile(StartReconcileEvent {
                timestamp: SystemTime::now(),
                stream_id: self.record.stream_id.clone(),
                expected_last: self.expected_last,
            }),
        );
        let result = self.reconcile_impl();
        Event::publish(
            &self.cache.params.event_publisher,
            Event::EndReconcile(EndReconcileEvent {
                timestamp: SystemTime::now(),
                stream_id: self.record.stream_id.clone(),
                forward_miniblocks: self.stats.forward_miniblocks,
                backfill_miniblocks: self.stats.backfill_miniblocks,
                reinitialized: self.stats.backward_reinitialized,
            }),
        );
        result.map(|()| self.stats)
    }

    fn reconcile_impl(&mut self) -> Result<(), StreamError> {
        self.ctx.check()?;
        if self.record.is_sealed {
            match self.cache.params.storage.is_stream_ephemeral(&self.record.stream_id) {
                Ok(true) => return self.normalize_ephemeral(),
                Err(err) if err.is_not_found() => return self.normalize_ephemeral(),
                Ok(false) => (),
                Err(err) => return Err(err),
            }
        }

        self.load_ranges()?;

        if self.remotes.is_empty() {
            return self.reconcile_without_remotes();
        }

        if !self.record.is_replicated() {
            // The registry only learns about miniblocks of non-replicated streams that carry a snapshot.
            if let Some(remote_last) = self.remote_last_miniblock_num() {
                self.expected_last = self.expected_last.max(remote_last);
            }
        }

        if self.local_last >= self.expected_last {
            return self.backfill();
        }
        if self.local_last + 1 == self.expected_last && self.try_promote_local_candidate()? {
            return self.backfill();
        }
        if self.expected_last == 0 {
            return self.init_from_registry_genesis();
        }

        let gap = self.expected_last - self.local_last;
        let config = &self.cache.params.config;
        if !self.cache.settings.enable_backwards_reconciliation || gap <= config.backwards_reconciliation_threshold {
            self.reconcile_forward()?;
        } else {
            self.reconcile_backward()?;
            if self.local_last < self.expected_last {
                self.reconcile_forward()?;
            }
        }

        self.load_ranges()?;
        self.backfill()
    }

    fn load_ranges(&mut self) -> Result<(), StreamError> {
        match self.cache.params.storage.get_miniblock_number_ranges(&self.record.stream_id, 0) {
            Ok(ranges) if !ranges.is_empty() => {
                self.local_last = ranges[ranges.len() - 1].end_inclusive;
                self.not_found = false;
                self.present = ranges;
            }
            Ok(_) => self.set_not_found(),
            Err(err) if err.is_not_found() => self.set_not_found(),
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn set_not_found(&mut self) {
        self.local_last = -1;
        self.not_found = true;
        self.present.clear();
    }

    fn reconcile_without_remotes(&mut self) -> Result<(), StreamError> {
        if self.local_last >= self.expected_last {
            return Ok(());
        }
        if self.local_last + 1 == self.expected_last && self.try_promote_local_candidate()? {
            return Ok(());
        }
        if self.expected_last == 0 {
            return self.init_from_registry_genesis();
        }
        Err(StreamError::Unavailable {
            reason: format!(
                "stream {} is at {} locally, {} in the registry, and has no remotes",
                self.record.stream_id, self.local_last, self.expected_last
            ),
            errors: Vec::new(),
        })
    }

    /// Highest last miniblock reported by a remote, if any remote answers.
    fn remote_last_miniblock_num(&mut self) -> Option<i64> {
        let remotes = self.cache.remotes.clone();
        let stream_id = self.record.stream_id.clone();
        let ctx = self.ctx;
        let mut remote_last = None;
        let result = self.remotes.execute(|node| {
            remote_last = Some(remotes.get_last_miniblock_hash(ctx, &node, &stream_id)?.num);
            Ok(())
        });
        if let Err(err) = result {
            log::debug!("{}: no remote reported its last miniblock: {}", stream_id, err);
        }
        remote_last
    }

    /// Promote the registry's last miniblock from a candidate stored locally. Returns false if the stream
    /// is still behind afterwards.
    fn try_promote_local_candidate(&mut self) -> Result<bool, StreamError> {
        if self.not_found {
            return Ok(false);
        }
        if self.expected_last != self.record.last_miniblock_num {
            return Ok(false);
        }
        match self.stream.promote_candidate(self.ctx, self.record.last_miniblock()) {
            Ok(()) => (),
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                log::debug!("{}: local candidate promotion failed: {}", self.record.stream_id, err);
                return Ok(false);
            }
        }
        let last = self.stream.get_last_miniblock_num_skip_load()?;
        Ok(last >= self.expected_last)
    }

    fn init_from_registry_genesis(&mut self) -> Result<(), StreamError> {
        let with_genesis = self.cache.params.registry.get_stream_with_genesis(self.ctx, &self.record.stream_id)?;
        let genesis = with_genesis
            .genesis_miniblock
            .into_info(&MiniblockInfoOpts::new().with_expected_block_number(0))?;
        if genesis.hash() != with_genesis.genesis_miniblock_hash {
            return Err(StreamError::bad_block(format!(
                "genesis miniblock hash {} does not match registry {}",
                genesis.hash(),
                with_genesis.genesis_miniblock_hash
            )));
        }
        self.stream.import_miniblocks(self.ctx, &[Arc::new(genesis)])?;
        self.local_last = 0;
        self.not_found = false;
        Ok(())
    }

    /// Fetch `[from_inclusive, to_exclusive)` from the remotes. The response may stop early, but it always
    /// starts at `from_inclusive` and is contiguous.
    fn fetch_miniblocks(&mut self, from_inclusive: i64, to_exclusive: i64) -> Result<Vec<Arc<MiniblockInfo>>, StreamError> {
        let remotes = self.cache.remotes.clone();
        let stream_id = self.record.stream_id.clone();
        let ctx = self.ctx;
        let mut fetched: Vec<MiniblockWithSnapshot> = Vec::new();
        self.remotes.execute(|node| {
            let response = remotes.get_mbs(ctx, &node, &stream_id, from_inclusive, to_exclusive)?;
            if response.miniblocks.is_empty() {
                return Err(StreamError::Unavailable {
                    reason: format!("{} returned no miniblocks of {} from {}", node, stream_id, from_inclusive),
                    errors: Vec::new(),
                });
            }
            fetched = response.miniblocks;
            Ok(())
        })?;

        let mut miniblocks: Vec<Arc<MiniblockInfo>> = Vec::with_capacity(fetched.len());
        for (i, miniblock) in fetched.into_iter().enumerate() {
            let mut opts = MiniblockInfoOpts::new().with_expected_block_number(from_inclusive + i as i64);
            if let Some(prev) = miniblocks.last() {
                opts = opts
                    .with_expected_prev_miniblock_hash(prev.hash())
                    .with_expected_minimum_timestamp_exclusive(prev.header().timestamp)
                    .with_expected_prev_snapshot_miniblock_num(prev.latest_snapshot_num());
            }
            let info = miniblock.into_info(&opts).map_err(|err| {
                if i == 0 {
                    StreamError::internal(format!(
                        "{}: remote returned wrong first miniblock, expected {}: {}",
                        self.record.stream_id, from_inclusive, err
                    ))
                } else {
                    err
                }
            })?;
            miniblocks.push(Arc::new(info));
        }
        Ok(miniblocks)
    }

    fn reconcile_forward(&mut self) -> Result<(), StreamError> {
        let page_size = self.cache.params.config.reconciliation_page_size.max(1);
        while self.local_last < self.expected_last {
            self.ctx.check()?;
            let from = self.local_last + 1;
            let to = (from + page_size).min(self.expected_last + 1);
            let miniblocks = self.fetch_miniblocks(from, to)?;
            self.stream.import_miniblocks(self.ctx, &miniblocks)?;
            self.local_last = from + miniblocks.len() as i64 - 1;
            self.not_found = false;
            self.stats.forward_miniblocks += miniblocks.len();
        }
        Ok(())
    }

    fn reconcile_backward(&mut self) -> Result<(), StreamError> {
        let remotes = self.cache.remotes.clone();
        let stream_id = self.record.stream_id.clone();
        let ctx = self.ctx;
        let num_preceding = self.cache.params.config.recency_constraints_gen;
        let local_last = self.local_last;
        let mut fetched = None;
        self.remotes.execute(|node| {
            let stream = remotes.get_stream(ctx, &node, &stream_id, num_preceding)?;
            let remote_last = stream.next_sync_cookie.minipool_gen - 1;
            if remote_last <= local_last {
                return Err(StreamError::Unavailable {
                    reason: format!("{} has {} up to {}, not past local {}", node, stream_id, remote_last, local_last),
                    errors: Vec::new(),
                });
            }
            fetched = Some(stream);
            Ok(())
        })?;
        let fetched = fetched.ok_or_else(|| StreamError::internal("remote stream missing after successful fetch"))?;

        self.stream.reinitialize(self.ctx, fetched, !self.not_found)?;
        self.stats.backward_reinitialized = true;
        self.not_found = false;
        self.local_last = self.stream.get_last_miniblock_num_skip_load()?;
        Ok(())
    }

    /// First miniblock the node keeps for this stream.
    fn local_start(&self) -> i64 {
        let history = self
            .cache
            .params
            .config
            .stream_history_miniblocks
            .for_type(self.record.stream_id.stream_type());
        if history <= 0 {
            return 0;
        }
        let start = (self.local_last - history).max(0);
        find_closest_snapshot_miniblock(&self.present, start)
    }

    fn backfill(&mut self) -> Result<(), StreamError> {
        if !self.cache.settings.enable_backwards_reconciliation || self.not_found || self.local_last <= 0 {
            return Ok(());
        }
        let missing = calculate_missing_ranges(&self.present, self.local_start(), self.local_last);
        let page_size = self.cache.params.config.reconciliation_page_size.max(1);
        for range in missing.iter().rev() {
            let mut to_exclusive = range.end_inclusive + 1;
            while to_exclusive > range.start_inclusive {
                self.ctx.check()?;
                let from = (to_exclusive - page_size).max(range.start_inclusive);
                let miniblocks = self.fetch_miniblocks(from, to_exclusive)?;
                self.stream.write_preceding_miniblocks(&miniblocks)?;
                self.stats.backfill_miniblocks += miniblocks.len();
                to_exclusive = from;
            }
        }
        Ok(())
    }

    /// Complete a sealed stream whose miniblocks were uploaded before it was registered, then seal its
    /// storage.
    fn normalize_ephemeral(&mut self) -> Result<(), StreamError> {
        let storage = self.cache.params.storage.clone();
        let stream_id = self.record.stream_id.clone();
        if let Err(err) = storage.is_stream_ephemeral(&stream_id) {
            if !err.is_not_found() {
                return Err(err);
            }
            let with_genesis = self.cache.params.registry.get_stream_with_genesis(self.ctx, &stream_id)?;
            let genesis = with_genesis
                .genesis_miniblock
                .into_info(&MiniblockInfoOpts::new().with_expected_block_number(0))?;
            match storage.create_ephemeral_stream_storage(&stream_id, &genesis.as_storage_mb()?) {
                Ok(()) => (),
                Err(err) if err.is_already_exists() => (),
                Err(err) => return Err(err),
            }
        }

        let present = storage.get_miniblock_number_ranges(&stream_id, 0)?;
        let page_size = self.cache.params.config.reconciliation_page_size.max(1);
        for range in calculate_missing_ranges(&present, 0, self.record.last_miniblock_num) {
            let mut from = range.start_inclusive;
            while from <= range.end_inclusive {
                self.ctx.check()?;
                let to = (from + page_size).min(range.end_inclusive + 1);
                let miniblocks = self.fetch_miniblocks(from, to)?;
                for miniblock in &miniblocks {
                    storage.write_ephemeral_miniblock(&stream_id, &miniblock.as_storage_mb()?)?;
                }
                self.stats.forward_miniblocks += miniblocks.len();
                from += miniblocks.len() as i64;
            }
        }

        let last_hash = storage.normalize_ephemeral_stream(&stream_id)?;
        if last_hash != self.record.last_miniblock_hash {
            return Err(StreamError::DataLoss {
                reason: format!(
                    "normalized stream {} ends at {} but the registry has {}",
                    stream_id, last_hash, self.record.last_miniblock_hash
                ),
            });
        }
        self.stream.force_flush();
        Ok(())
    }
}
