/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A stream as held by one node: the current [`StreamView`] behind a lock, the node placement, pending
//! candidate promotions, and subscribers.
//!
//! Every state transition takes the write lock, derives a new view from the current one, persists the
//! difference, and swaps the view in. Readers clone the `Arc` of the current view and never block a writer
//! for longer than that.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use borsh::BorshSerialize;

use crate::config::StreamConfig;
use crate::context::Context;
use crate::errors::StreamError;
use crate::events::{AddEventEvent, ApplyMiniblockEvent, Event, LoadStreamEvent, PromoteCandidateEvent, SaveCandidateEvent, UnloadStreamEvent};
use crate::registry::{Registry, StreamUpdatedEvent};
use crate::storage::{MiniblockDescriptor, StreamStorage};
use crate::types::crypto_primitives::Wallet;
use crate::types::data_types::{Address, BlockNumber, MiniblockRef, StreamId};
use crate::types::envelope::{Envelope, ParsedEvent};
use crate::types::miniblock::{MiniblockInfo, MiniblockInfoOpts};
use crate::types::stream_record::{StreamNodes, StreamRecord};

use super::view::{StreamAndCookie, StreamView, SyncCookie};

/// Receives the updates of a subscribed stream.
pub trait SyncResultReceiver: Send + Sync {
    fn on_update(&self, update: StreamAndCookie);

    /// The subscription ended. The receiver must subscribe again to resume.
    fn on_sync_error(&self, err: &StreamError);
}

/// Collaborators shared by every stream of a node.
pub(crate) struct StreamParams {
    pub(crate) storage: Arc<dyn StreamStorage>,
    pub(crate) wallet: Arc<Wallet>,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) config: StreamConfig,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl StreamParams {
    pub(crate) fn local_address(&self) -> Address {
        self.wallet.address()
    }
}

struct StreamInner {
    view: Option<Arc<StreamView>>,
    receivers: Vec<Arc<dyn SyncResultReceiver>>,
    /// Confirmed miniblocks waiting for their candidate, in order. The first one is `last + 1`.
    pending_candidates: Vec<MiniblockRef>,
    last_applied_block: Option<BlockNumber>,
}

pub struct Stream {
    params: Arc<StreamParams>,
    stream_id: StreamId,
    inner: RwLock<StreamInner>,
    nodes: Mutex<StreamNodes>,
    last_accessed: Mutex<Instant>,
}

impl Stream {
    pub(crate) fn new(params: Arc<StreamParams>, record: &StreamRecord, last_applied_block: Option<BlockNumber>) -> Stream {
        let nodes = StreamNodes::new(params.local_address(), &record.nodes, record.replication_factor);
        Stream {
            params,
            stream_id: record.stream_id.clone(),
            inner: RwLock::new(StreamInner {
                view: None,
                receivers: Vec::new(),
                pending_candidates: Vec::new(),
                last_applied_block,
            }),
            nodes: Mutex::new(nodes),
            last_accessed: Mutex::new(Instant::now()),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StreamStorage> {
        &self.params.storage
    }

    /// The current view, loading it from storage or the registry genesis if needed.
    pub fn get_view(&self, ctx: &Context) -> Result<Arc<StreamView>, StreamError> {
        self.touch();
        if let Some(view) = self.inner.read().unwrap().view.clone() {
            return Ok(view);
        }
        let mut inner = self.inner.write().unwrap();
        self.load_locked(ctx, &mut inner)
    }

    /// The current view if the stream is placed on this node, `None` otherwise.
    pub fn get_view_if_local(&self, ctx: &Context) -> Result<Option<Arc<StreamView>>, StreamError> {
        if !self.is_local() {
            return Ok(None);
        }
        self.get_view(ctx).map(Some)
    }

    /// The current view, if one is loaded. Never touches storage.
    pub fn get_view_if_loaded(&self) -> Option<Arc<StreamView>> {
        self.inner.read().unwrap().view.clone()
    }

    fn touch(&self) {
        *self.last_accessed.lock().unwrap() = Instant::now();
    }

    fn load_locked(&self, ctx: &Context, inner: &mut StreamInner) -> Result<Arc<StreamView>, StreamError> {
        if let Some(view) = &inner.view {
            return Ok(view.clone());
        }
        if !self.is_local() {
            return Err(StreamError::not_found(format!("stream {} is not placed on this node", self.stream_id)));
        }
        ctx.check()?;

        let view = match self
            .params
            .storage
            .read_stream_from_last_snapshot(&self.stream_id, self.params.config.recency_constraints_gen)
        {
            Ok(stored) => Arc::new(StreamView::from_storage(&stored)?),
            Err(err) if err.is_not_found() => self.init_from_registry(ctx)?,
            Err(err) => return Err(err),
        };
        self.set_view(inner, view.clone());
        Event::publish(
            &self.params.event_publisher,
            Event::LoadStream(LoadStreamEvent {
                timestamp: SystemTime::now(),
                stream_id: self.stream_id.clone(),
                last_miniblock: view.last_block_ref(),
            }),
        );
        Ok(view)
    }

    /// Create local storage from the genesis miniblock in the registry. Only possible while the stream has
    /// nothing committed beyond genesis.
    fn init_from_registry(&self, ctx: &Context) -> Result<Arc<StreamView>, StreamError> {
        let with_genesis = self.params.registry.get_stream_with_genesis(ctx, &self.stream_id)?;
        if !with_genesis.record.contains(&self.params.local_address()) {
            return Err(StreamError::not_found(format!("stream {} is not placed on this node", self.stream_id)));
        }
        if with_genesis.record.last_miniblock_num > 0 {
            return Err(StreamError::StreamReconciliationRequired {
                stream_id: self.stream_id.clone(),
                reason: format!("registry is at miniblock {}", with_genesis.record.last_miniblock_num),
            });
        }
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
        self.create_storage_from_genesis(&genesis)
    }

    fn create_storage_from_genesis(&self, genesis: &MiniblockInfo) -> Result<Arc<StreamView>, StreamError> {
        match self.params.storage.create_stream_storage(&self.stream_id, &genesis.as_storage_mb()?) {
            Ok(()) => Ok(Arc::new(StreamView::from_genesis(Arc::new(genesis.clone()))?)),
            Err(err) if err.is_already_exists() => {
                let stored = self
                    .params
                    .storage
                    .read_stream_from_last_snapshot(&self.stream_id, self.params.config.recency_constraints_gen)?;
                Ok(Arc::new(StreamView::from_storage(&stored)?))
            }
            Err(err) => Err(err),
        }
    }

    fn set_view(&self, inner: &mut StreamInner, view: Arc<StreamView>) {
        let last = view.last_block_num();
        inner.pending_candidates.retain(|candidate| candidate.num > last);
        inner.view = Some(view);
    }

    fn notify(&self, inner: &StreamInner, view: &StreamView, events: Vec<Envelope>) {
        if inner.receivers.is_empty() {
            return;
        }
        let update = StreamAndCookie {
            events,
            next_sync_cookie: view.sync_cookie(self.params.local_address()),
            miniblocks: Vec::new(),
            snapshot: None,
            sync_reset: false,
            snapshot_miniblock_index: 0,
        };
        for receiver in &inner.receivers {
            receiver.on_update(update.clone());
        }
    }

    /// Add an event a client submitted to this node. On top of [`Stream::add_event`], the miniblock the
    /// event references must not have been superseded for longer than the recency age.
    pub fn add_client_event(&self, ctx: &Context, event: ParsedEvent) -> Result<Arc<StreamView>, StreamError> {
        self.add_event_at(ctx, event, Some(SystemTime::now()))
    }

    /// Add `event` to the minipool and persist it. Adding an event that is already present is a no-op that
    /// returns the current view.
    /// Events replicated from peers are not checked for recency.
    pub fn add_event(&self, ctx: &Context, event: ParsedEvent) -> Result<Arc<StreamView>, StreamError> {
        self.add_event_at(ctx, event, None)
    }

    fn add_event_at(&self, ctx: &Context, event: ParsedEvent, now: Option<SystemTime>) -> Result<Arc<StreamView>, StreamError> {
        self.touch();
        let mut inner = self.inner.write().unwrap();
        let view = self.load_locked(ctx, &mut inner)?;

        match view.validate_next_event(&self.params.config, &event, now) {
            Ok(()) => (),
            Err(StreamError::DuplicateEvent { .. }) => return Ok(view),
            Err(err) => return Err(err),
        }

        let event = Arc::new(event);
        let next = Arc::new(view.copy_and_add_event(event.clone())?);
        let bytes = event
            .envelope
            .try_to_vec()
            .map_err(|err| StreamError::internal(format!("failed to serialize event {}: {}", event.hash, err)))?;
        self.params
            .storage
            .write_event(&self.stream_id, view.generation(), view.minipool().next_slot_number(), &bytes)?;

        self.set_view(&mut inner, next.clone());
        Event::publish(
            &self.params.event_publisher,
            Event::AddEvent(AddEventEvent {
                timestamp: SystemTime::now(),
                stream_id: self.stream_id.clone(),
                event: event.hash,
                generation: next.generation(),
            }),
        );
        self.notify(&inner, &next, vec![event.envelope.clone()]);
        Ok(next)
    }

    /// Apply a miniblock that extends the current view. Already applied miniblocks are ignored.
    pub fn apply_miniblock(&self, ctx: &Context, miniblock: Arc<MiniblockInfo>) -> Result<(), StreamError> {
        let mut inner = self.inner.write().unwrap();
        self.load_locked(ctx, &mut inner)?;
        self.apply_miniblock_locked(&mut inner, miniblock)
    }

    fn apply_miniblock_locked(&self, inner: &mut StreamInner, miniblock: Arc<MiniblockInfo>) -> Result<(), StreamError> {
        let view = match &inner.view {
            Some(view) => view.clone(),
            None => return Err(StreamError::internal(format!("stream {} is not loaded", self.stream_id))),
        };
        if miniblock.num() <= view.last_block_num() {
            return Ok(());
        }

        let (next, mut new_events) = view.copy_and_apply_block(miniblock.clone(), &self.params.config)?;
        self.params.storage.write_miniblocks(
            &self.stream_id,
            &[miniblock.as_storage_mb()?],
            next.generation(),
            next.minipool().envelope_bytes()?,
            view.generation(),
            view.minipool().len(),
        )?;

        let next = Arc::new(next);
        self.set_view(inner, next.clone());
        Event::publish(
            &self.params.event_publisher,
            Event::ApplyMiniblock(ApplyMiniblockEvent {
                timestamp: SystemTime::now(),
                stream_id: self.stream_id.clone(),
                miniblock: miniblock.miniblock_ref,
                events: miniblock.events().len(),
                has_snapshot: miniblock.has_snapshot(),
            }),
        );
        new_events.push(miniblock.header_event().envelope.clone());
        self.notify(inner, &next, new_events);
        Ok(())
    }

    /// Apply a contiguous run of miniblocks fetched from a peer, skipping those already applied. If the
    /// stream has no local storage yet and the run starts at genesis, storage is created from it.
    pub fn import_miniblocks(&self, ctx: &Context, miniblocks: &[Arc<MiniblockInfo>]) -> Result<(), StreamError> {
        let first = match miniblocks.first() {
            Some(first) => first,
            None => return Ok(()),
        };
        for pair in miniblocks.windows(2) {
            if pair[1].num() != pair[0].num() + 1 {
                return Err(StreamError::invalid_argument(format!(
                    "imported miniblocks are not sequential: {} then {}",
                    pair[0].num(),
                    pair[1].num()
                )));
            }
        }

        let mut inner = self.inner.write().unwrap();
        if inner.view.is_none() && first.num() == 0 {
            self.init_from_genesis(ctx, &mut inner, first)?;
        }
        let view = self.load_locked(ctx, &mut inner)?;

        let mut next = view.clone();
        let mut descriptors = Vec::new();
        let mut new_events = Vec::new();
        for miniblock in miniblocks.iter().filter(|mb| mb.num() > view.last_block_num()) {
            let (applied, events) = next.copy_and_apply_block(miniblock.clone(), &self.params.config)?;
            descriptors.push(miniblock.as_storage_mb()?);
            new_events.extend(events);
            new_events.push(miniblock.header_event().envelope.clone());
            next = Arc::new(applied);
        }
        if descriptors.is_empty() {
            return Ok(());
        }

        self.params.storage.write_miniblocks(
            &self.stream_id,
            &descriptors,
            next.generation(),
            next.minipool().envelope_bytes()?,
            view.generation(),
            view.minipool().len(),
        )?;
        self.set_view(&mut inner, next.clone());
        Event::publish(
            &self.params.event_publisher,
            Event::ApplyMiniblock(ApplyMiniblockEvent {
                timestamp: SystemTime::now(),
                stream_id: self.stream_id.clone(),
                miniblock: next.last_block_ref(),
                events: new_events.len(),
                has_snapshot: next.last_block().has_snapshot(),
            }),
        );
        self.notify(&inner, &next, new_events);
        Ok(())
    }

    fn init_from_genesis(&self, ctx: &Context, inner: &mut StreamInner, genesis: &MiniblockInfo) -> Result<(), StreamError> {
        let record = self.params.registry.get_stream_with_genesis(ctx, &self.stream_id)?;
        if record.genesis_miniblock_hash != genesis.hash() {
            return Err(StreamError::bad_block(format!(
                "genesis miniblock hash {} does not match registry {}",
                genesis.hash(),
                record.genesis_miniblock_hash
            )));
        }
        let view = self.create_storage_from_genesis(genesis)?;
        self.set_view(inner, view);
        Ok(())
    }

    /// Promote a miniblock the registry confirmed. If its candidate is not stored yet, or an earlier
    /// confirmation is still waiting, the promotion is queued.
    pub fn promote_candidate(&self, ctx: &Context, candidate: MiniblockRef) -> Result<(), StreamError> {
        let mut inner = self.inner.write().unwrap();
        let view = self.load_locked(ctx, &mut inner)?;

        let last = view.last_block_ref();
        if candidate.num <= last.num {
            if let Ok(existing) = view.block_with_num(candidate.num) {
                if existing.hash() != candidate.hash {
                    log::warn!(
                        "{}: confirmed miniblock {} differs from applied {}",
                        self.stream_id,
                        candidate,
                        existing.miniblock_ref
                    );
                }
            }
            return Ok(());
        }
        if candidate.num > last.num + 1 || !inner.pending_candidates.is_empty() {
            return self.schedule_promotion(&mut inner, &view, candidate);
        }

        if !self.try_read_and_apply_candidate(&mut inner, candidate)? {
            return self.schedule_promotion(&mut inner, &view, candidate);
        }
        self.apply_pending_candidates(&mut inner)
    }

    fn schedule_promotion(&self, inner: &mut StreamInner, view: &StreamView, candidate: MiniblockRef) -> Result<(), StreamError> {
        let expected = match inner.pending_candidates.last() {
            Some(last_pending) => last_pending.num + 1,
            None => view.last_block_num() + 1,
        };
        if candidate.num != expected {
            return Err(StreamError::StreamReconciliationRequired {
                stream_id: self.stream_id.clone(),
                reason: format!("confirmed miniblock {} but next expected is {}", candidate.num, expected),
            });
        }
        if inner.pending_candidates.len() >= self.params.config.max_pending_candidates {
            return Err(StreamError::StreamReconciliationRequired {
                stream_id: self.stream_id.clone(),
                reason: format!("{} candidates already pending", inner.pending_candidates.len()),
            });
        }
        inner.pending_candidates.push(candidate);
        Ok(())
    }

    fn try_read_and_apply_candidate(&self, inner: &mut StreamInner, candidate: MiniblockRef) -> Result<bool, StreamError> {
        let descriptor = match self.params.storage.read_miniblock_candidate(&self.stream_id, &candidate.hash, candidate.num) {
            Ok(descriptor) => descriptor,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        let miniblock = MiniblockInfo::from_descriptor(&descriptor, &MiniblockInfoOpts::new().with_expected_block_number(candidate.num))?;
        self.apply_miniblock_locked(inner, Arc::new(miniblock))?;
        Event::publish(
            &self.params.event_publisher,
            Event::PromoteCandidate(PromoteCandidateEvent {
                timestamp: SystemTime::now(),
                stream_id: self.stream_id.clone(),
                candidate,
            }),
        );
        Ok(true)
    }

    fn apply_pending_candidates(&self, inner: &mut StreamInner) -> Result<(), StreamError> {
        while let Some(next) = inner.pending_candidates.first().copied() {
            if !self.try_read_and_apply_candidate(inner, next)? {
                break;
            }
        }
        Ok(())
    }

    /// Store a candidate produced by this node or a peer. If it is the next pending promotion it is
    /// applied right away.
    pub fn save_miniblock_candidate(&self, ctx: &Context, candidate: Arc<MiniblockInfo>) -> Result<(), StreamError> {
        let mut inner = self.inner.write().unwrap();
        self.load_locked(ctx, &mut inner)?;
        if self.try_apply_candidate(&mut inner, candidate.clone())? {
            return Ok(());
        }
        self.params.storage.write_miniblock_candidate(&self.stream_id, &candidate.as_storage_mb()?)?;
        Event::publish(
            &self.params.event_publisher,
            Event::SaveCandidate(SaveCandidateEvent {
                timestamp: SystemTime::now(),
                stream_id: self.stream_id.clone(),
                candidate: candidate.miniblock_ref,
            }),
        );
        Ok(())
    }

    fn try_apply_candidate(&self, inner: &mut StreamInner, candidate: Arc<MiniblockInfo>) -> Result<bool, StreamError> {
        let view = match &inner.view {
            Some(view) => view.clone(),
            None => return Ok(false),
        };
        if candidate.num() <= view.last_block_num() {
            return match view.block_with_num(candidate.num()) {
                Ok(existing) if existing.hash() == candidate.hash() => Ok(true),
                Ok(existing) => Err(StreamError::internal(format!(
                    "{}: candidate {} conflicts with applied miniblock {}",
                    self.stream_id, candidate.miniblock_ref, existing.miniblock_ref
                ))),
                // Older than the view window, so long since settled.
                Err(_) => Ok(true),
            };
        }

        if inner.pending_candidates.first() == Some(&candidate.miniblock_ref) {
            self.apply_miniblock_locked(inner, candidate.clone())?;
            Event::publish(
                &self.params.event_publisher,
                Event::PromoteCandidate(PromoteCandidateEvent {
                    timestamp: SystemTime::now(),
                    stream_id: self.stream_id.clone(),
                    candidate: candidate.miniblock_ref,
                }),
            );
            self.apply_pending_candidates(inner)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Committed miniblocks in `[from_inclusive, to_exclusive)`, served from the view when it covers the
    /// range. The flag is set if the range starts at genesis.
    pub fn get_miniblocks(
        &self,
        ctx: &Context,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<(Vec<Arc<MiniblockInfo>>, bool), StreamError> {
        let terminus = from_inclusive == 0;
        if let Some(view) = self.get_view_if_loaded() {
            let first = view.blocks()[0].num();
            if from_inclusive >= first && to_exclusive <= view.last_block_num() + 1 {
                let start = (from_inclusive - first) as usize;
                let end = (to_exclusive - first).max(from_inclusive - first) as usize;
                return Ok((view.blocks()[start..end].to_vec(), terminus));
            }
        }
        ctx.check()?;
        let descriptors = self.params.storage.read_miniblocks(&self.stream_id, from_inclusive, to_exclusive)?;
        Ok((parse_descriptors(&descriptors)?, terminus))
    }

    pub fn get_miniblocks_by_ids(&self, ctx: &Context, nums: &[i64]) -> Result<Vec<Arc<MiniblockInfo>>, StreamError> {
        ctx.check()?;
        let descriptors = self.params.storage.read_miniblocks_by_ids(&self.stream_id, nums)?;
        parse_descriptors(&descriptors)
    }

    /// Last miniblock number, from the view if loaded, otherwise from storage.
    pub fn get_last_miniblock_num_skip_load(&self) -> Result<i64, StreamError> {
        match self.get_view_if_loaded() {
            Some(view) => Ok(view.last_block_num()),
            None => self.params.storage.get_last_miniblock_number(&self.stream_id),
        }
    }

    /// Replace local storage with the state a peer returned, then reload the view.
    pub fn reinitialize(&self, ctx: &Context, stream: StreamAndCookie, update_existing: bool) -> Result<(), StreamError> {
        if stream.miniblocks.is_empty() {
            return Err(StreamError::invalid_argument("no miniblocks to reinitialize from"));
        }
        let mut miniblocks: Vec<MiniblockInfo> = Vec::with_capacity(stream.miniblocks.len());
        for (i, miniblock) in stream.miniblocks.into_iter().enumerate() {
            let snapshot = if i == stream.snapshot_miniblock_index { stream.snapshot.clone() } else { None };
            let mut opts = MiniblockInfoOpts::new();
            if let Some(prev) = miniblocks.last() {
                opts = opts.with_expected_block_number(prev.num() + 1).with_expected_prev_miniblock_hash(prev.hash());
            }
            miniblocks.push(MiniblockInfo::new(miniblock, snapshot, &opts)?);
        }
        let snapshot_block = miniblocks
            .get(stream.snapshot_miniblock_index)
            .filter(|mb| mb.snapshot().is_some())
            .ok_or_else(|| StreamError::bad_block("reinitialization miniblocks carry no snapshot"))?;
        let last_snapshot_num = snapshot_block.num();

        let descriptors = miniblocks.iter().map(|mb| mb.as_storage_mb()).collect::<Result<Vec<MiniblockDescriptor>, _>>()?;
        ctx.check()?;

        let mut inner = self.inner.write().unwrap();
        self.params
            .storage
            .reinitialize_stream_storage(&self.stream_id, &descriptors, last_snapshot_num, update_existing)?;
        inner.view = None;
        let view = self.load_locked(ctx, &mut inner)?;
        if !inner.receivers.is_empty() {
            let reset = view.get_reset_stream_and_cookie(self.params.local_address());
            for receiver in &inner.receivers {
                receiver.on_update(reset.clone());
            }
        }
        Ok(())
    }

    /// Store miniblocks that fill a gap before the last one, and add them to the view if they directly
    /// precede it.
    pub fn write_preceding_miniblocks(&self, miniblocks: &[Arc<MiniblockInfo>]) -> Result<(), StreamError> {
        if miniblocks.is_empty() {
            return Ok(());
        }
        let descriptors = miniblocks.iter().map(|mb| mb.as_storage_mb()).collect::<Result<Vec<_>, _>>()?;
        let mut inner = self.inner.write().unwrap();
        self.params.storage.write_preceding_miniblocks(&self.stream_id, &descriptors)?;
        if let Some(view) = inner.view.clone() {
            let last = miniblocks[miniblocks.len() - 1].num();
            if last + 1 == view.blocks()[0].num() {
                match view.copy_and_prepend_miniblocks(miniblocks) {
                    Ok(next) => inner.view = Some(Arc::new(next)),
                    Err(err) => log::warn!("{}: failed to prepend backfilled miniblocks: {}", self.stream_id, err),
                }
            }
        }
        Ok(())
    }

    /// Subscribe `receiver` to updates after `cookie`. It immediately receives what it missed.
    pub fn sub(&self, ctx: &Context, cookie: &SyncCookie, receiver: Arc<dyn SyncResultReceiver>) -> Result<(), StreamError> {
        if !self.is_local() {
            return Err(StreamError::not_found(format!("stream {} is not placed on this node", self.stream_id)));
        }
        let local = self.params.local_address();
        if cookie.node_address != local {
            return Err(StreamError::invalid_argument(format!("cookie is for node {} not {}", cookie.node_address, local)));
        }
        if cookie.stream_id != self.stream_id {
            return Err(StreamError::invalid_argument(format!("cookie is for stream {} not {}", cookie.stream_id, self.stream_id)));
        }
        self.touch();
        let mut inner = self.inner.write().unwrap();
        let view = self.load_locked(ctx, &mut inner)?;
        receiver.on_update(view.get_stream_since(local, cookie)?);
        inner.receivers.push(receiver);
        Ok(())
    }

    pub fn unsub(&self, receiver: &Arc<dyn SyncResultReceiver>) {
        self.inner.write().unwrap().receivers.retain(|existing| !Arc::ptr_eq(existing, receiver));
    }

    /// Drop the view and end every subscription. Storage is untouched.
    pub fn force_flush(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.view = None;
        let err = StreamError::Unavailable { reason: format!("stream {} was flushed", self.stream_id), errors: Vec::new() };
        for receiver in inner.receivers.drain(..) {
            receiver.on_sync_error(&err);
        }
    }

    /// Unload the view if the stream has been idle for `expiration` and has nothing in flight. Returns
    /// true if no view is loaded afterwards.
    pub fn try_cleanup(&self, expiration: Duration) -> bool {
        if !self.is_local() {
            return false;
        }
        if self.last_accessed.lock().unwrap().elapsed() < expiration {
            return false;
        }
        let mut inner = self.inner.write().unwrap();
        let view = match &inner.view {
            Some(view) => view,
            None => return true,
        };
        if !view.minipool().is_empty() || !inner.pending_candidates.is_empty() || !inner.receivers.is_empty() {
            return false;
        }
        inner.view = None;
        Event::publish(
            &self.params.event_publisher,
            Event::UnloadStream(UnloadStreamEvent { timestamp: SystemTime::now(), stream_id: self.stream_id.clone() }),
        );
        true
    }

    /// True if this node holds the stream, it is loaded, and it has events to seal.
    pub fn can_create_miniblock(&self) -> bool {
        if !self.is_local() {
            return false;
        }
        match self.get_view_if_loaded() {
            Some(view) => !view.minipool().is_empty() && !view.settings().disable_miniblock_creation,
            None => false,
        }
    }

    /// Apply the registry events for this stream observed in `block_num`, in order. Blocks already applied
    /// are ignored, so all events of one block must be passed in one call. A failed event does not stop the
    /// ones after it; the first failure is returned.
    pub fn apply_stream_events(&self, ctx: &Context, events: &[&StreamUpdatedEvent], block_num: BlockNumber) -> Result<(), StreamError> {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.last_applied_block.map_or(false, |applied| applied >= block_num) {
                log::debug!("{}: events of block {} already applied", self.stream_id, block_num);
                return Ok(());
            }
            inner.last_applied_block = Some(block_num);
        }
        let mut first_err = None;
        for event in events {
            if let Err(err) = self.apply_stream_event(ctx, event) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_stream_event(&self, ctx: &Context, event: &StreamUpdatedEvent) -> Result<(), StreamError> {
        match event {
            StreamUpdatedEvent::PlacementUpdated { record } => {
                self.reset_nodes(record);
                Ok(())
            }
            StreamUpdatedEvent::LastMiniblockBatchUpdated { record } => {
                if !self.is_local() {
                    return Ok(());
                }
                if self.get_view_if_loaded().is_none() {
                    // The view loads the promoted state from storage on next access.
                    let last = self.get_last_miniblock_num_skip_load().unwrap_or(-1);
                    if last >= record.last_miniblock_num {
                        return Ok(());
                    }
                }
                self.promote_candidate(ctx, record.last_miniblock())
            }
            StreamUpdatedEvent::Allocated { .. } | StreamUpdatedEvent::Created { .. } => Ok(()),
        }
    }

    pub fn pending_candidates(&self) -> Vec<MiniblockRef> {
        self.inner.read().unwrap().pending_candidates.clone()
    }

    /* ↓↓↓ Placement ↓↓↓ */

    pub fn reset_nodes(&self, record: &StreamRecord) {
        self.nodes.lock().unwrap().reset(&record.nodes, record.replication_factor);
    }

    pub fn is_local(&self) -> bool {
        self.nodes.lock().unwrap().is_local()
    }

    pub fn is_local_in_quorum(&self) -> bool {
        self.nodes.lock().unwrap().is_local_in_quorum()
    }

    pub fn get_quorum_nodes(&self) -> Vec<Address> {
        self.nodes.lock().unwrap().quorum_nodes().to_vec()
    }

    pub fn get_sync_nodes(&self) -> Vec<Address> {
        self.nodes.lock().unwrap().sync_nodes().to_vec()
    }

    pub fn get_remotes_and_is_local(&self) -> (Vec<Address>, bool) {
        self.nodes.lock().unwrap().get_remotes_and_is_local()
    }

    pub fn get_sticky_peer(&self) -> Option<Address> {
        self.nodes.lock().unwrap().get_sticky_peer()
    }

    pub fn advance_sticky_peer(&self, current: &Address) -> Option<Address> {
        self.nodes.lock().unwrap().advance_sticky_peer(current)
    }
}

fn parse_descriptors(descriptors: &[MiniblockDescriptor]) -> Result<Vec<Arc<MiniblockInfo>>, StreamError> {
    let mut miniblocks = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        miniblocks.push(Arc::new(MiniblockInfo::from_descriptor(descriptor, &MiniblockInfoOpts::new())?));
    }
    Ok(miniblocks)
}
