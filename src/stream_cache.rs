/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of [streams](Stream) a node knows about, and the glue between them and the registry.
//!
//! The cache is filled from the registry when the node [starts](StreamCache::start) and kept current by
//! feeding it every registry block with [`StreamCache::on_block`]. Streams that are behind are brought up
//! to date by reconciliation tasks running on the cache's worker pools (see
//! [`reconciliation::tasks`](crate::reconciliation::tasks)).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::StreamConfig;
use crate::context::Context;
use crate::errors::StreamError;
use crate::networking::{MiniblockWithSnapshot, RemoteMiniblockProvider};
use crate::quorum_pool::TaskGroup;
use crate::reconciliation::tasks::{ReconcileTaskQueue, RetryQueue};
use crate::registry::{RegistryBlock, StreamUpdatedEvent};
use crate::stream::stream::StreamParams;
use crate::stream::{Stream, StreamView};
use crate::types::data_types::{Address, BlockNumber, StreamId};
use crate::types::miniblock::MiniblockInfoOpts;
use crate::types::stream_record::StreamRecord;
use crate::worker_pool::WorkerPool;

const WAIT_FOR_LOCAL_INITIAL_DELAY: Duration = Duration::from_millis(20);
const WAIT_FOR_LOCAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-process settings the cache and its tasks need, taken from the
/// [`NodeConfiguration`](crate::config::NodeConfiguration).
#[derive(Clone, Debug)]
pub(crate) struct CacheSettings {
    pub(crate) block_time: Duration,
    pub(crate) retry_reconciliation_interval: Duration,
    pub(crate) initial_sync_workers: usize,
    pub(crate) online_reconcile_workers: usize,
    pub(crate) enable_backwards_reconciliation: bool,
}

/// Which worker pool a task runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolKind {
    /// Syncing every stream when the node starts.
    Initial,
    /// Streams that fall behind while the node runs.
    Online,
}

struct Pools {
    initial: Option<WorkerPool>,
    online: Option<WorkerPool>,
}

/// Outcome of one [`StreamCache::cache_cleanup`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheCleanupResult {
    pub total: usize,
    pub unloaded: usize,
    /// Streams known to the cache but not placed on this node.
    pub remote: usize,
}

pub struct StreamCache {
    pub(crate) params: Arc<StreamParams>,
    pub(crate) remotes: Arc<dyn RemoteMiniblockProvider>,
    pub(crate) settings: CacheSettings,
    /// Cancelled when the node shuts down. Every background task runs under a child of it.
    pub(crate) server_ctx: Context,
    /// Writes to peers still running after their quorum was reached.
    pub(crate) write_tasks: Arc<TaskGroup>,
    pub(crate) reconcile_tasks: ReconcileTaskQueue,
    pub(crate) retry_queue: RetryQueue,
    streams: RwLock<HashMap<StreamId, Arc<Stream>>>,
    last_applied_block: Mutex<Option<BlockNumber>>,
    pools: Mutex<Pools>,
}

impl StreamCache {
    pub(crate) fn new(
        params: Arc<StreamParams>,
        remotes: Arc<dyn RemoteMiniblockProvider>,
        settings: CacheSettings,
    ) -> Arc<StreamCache> {
        let initial = if settings.initial_sync_workers > 0 {
            Some(WorkerPool::new("initial_sync", settings.initial_sync_workers))
        } else {
            None
        };
        let online = Some(WorkerPool::new("online_reconcile", settings.online_reconcile_workers));
        let server_ctx = Context::background();
        Arc::new(StreamCache {
            params,
            remotes,
            settings,
            write_tasks: Arc::new(TaskGroup::new(server_ctx.clone())),
            server_ctx,
            reconcile_tasks: ReconcileTaskQueue::new(),
            retry_queue: RetryQueue::new(),
            streams: RwLock::new(HashMap::new()),
            last_applied_block: Mutex::new(None),
            pools: Mutex::new(Pools { initial, online }),
        })
    }

    /// Load every stream the registry places on this node and, unless initial sync is disabled, queue a
    /// sync task for each.
    pub(crate) fn start(self: &Arc<Self>, ctx: &Context) -> Result<(), StreamError> {
        let local = self.local_address();
        let records = self.params.registry.get_streams_on_node(ctx, &local)?;
        log::info!("{}: loading {} streams", local, records.len());
        for record in records {
            let stream = self.load_or_store(&record);
            if self.settings.initial_sync_workers > 0 {
                self.submit_reconcile_task_to_pool(PoolKind::Initial, stream, Some(record));
            }
        }
        Ok(())
    }

    /// Cancel background work, then join the worker pools and the writes still running. Queued tasks run to
    /// completion against a cancelled context.
    pub(crate) fn stop(&self) {
        self.server_ctx.cancel();
        let (initial, online) = {
            let mut pools = self.pools.lock().unwrap();
            (pools.initial.take(), pools.online.take())
        };
        drop(initial);
        drop(online);
        self.write_tasks.join_all();
    }

    pub(crate) fn submit(&self, kind: PoolKind, job: impl FnOnce() + Send + 'static) {
        let pools = self.pools.lock().unwrap();
        let pool = match kind {
            PoolKind::Initial => pools.initial.as_ref().or(pools.online.as_ref()),
            PoolKind::Online => pools.online.as_ref(),
        };
        match pool {
            Some(pool) => {
                pool.submit(job);
            }
            None => log::debug!("stream cache is stopped, task dropped"),
        }
    }

    fn load_or_store(&self, record: &StreamRecord) -> Arc<Stream> {
        if let Some(stream) = self.streams.read().unwrap().get(&record.stream_id) {
            return stream.clone();
        }
        self.streams
            .write()
            .unwrap()
            .entry(record.stream_id.clone())
            .or_insert_with(|| Arc::new(Stream::new(self.params.clone(), record, None)))
            .clone()
    }

    pub(crate) fn get_loaded_stream(&self, stream_id: &StreamId) -> Option<Arc<Stream>> {
        self.streams.read().unwrap().get(stream_id).cloned()
    }

    /* ↓↓↓ Registry events ↓↓↓ */

    /// Apply the stream events of a registry block. Blocks at or before the last applied one are ignored.
    ///
    /// Events are grouped by stream, keeping their order, and each stream applies its group at once.
    pub(crate) fn on_block(self: &Arc<Self>, ctx: &Context, block: &RegistryBlock) {
        {
            let mut last = self.last_applied_block.lock().unwrap();
            if last.map_or(false, |last| last >= block.number) {
                return;
            }
            *last = Some(block.number);
        }
        for (stream_id, events) in group_by_stream(&block.events) {
            self.on_stream_events(ctx, stream_id, &events, block.number);
        }
    }

    fn on_stream_events(self: &Arc<Self>, ctx: &Context, stream_id: &StreamId, events: &[&StreamUpdatedEvent], block_num: BlockNumber) {
        let local = self.local_address();
        let mut updates: Vec<&StreamUpdatedEvent> = Vec::with_capacity(events.len());
        for event in events {
            match event {
                StreamUpdatedEvent::Allocated { record, genesis_miniblock } => {
                    if !record.contains(&local) {
                        continue;
                    }
                    if let Err(err) = self.on_stream_allocated(record, genesis_miniblock.clone()) {
                        log::warn!("{}: failed to allocate stream: {}", stream_id, err);
                    }
                }
                StreamUpdatedEvent::Created { record } => {
                    if record.contains(&local) {
                        let stream = self.load_or_store(record);
                        self.submit_reconcile_stream_task(stream, Some(record.clone()));
                    }
                }
                StreamUpdatedEvent::PlacementUpdated { .. } | StreamUpdatedEvent::LastMiniblockBatchUpdated { .. } => {
                    updates.push(*event)
                }
            }
        }
        let latest = match updates.last() {
            Some(event) => event.record(),
            None => return,
        };

        let stream = match self.get_loaded_stream(stream_id) {
            Some(stream) => stream,
            None if updates.iter().any(|event| event.record().contains(&local)) => self.load_or_store(latest),
            None => return,
        };
        let placement_updated = updates.iter().any(|event| matches!(event, StreamUpdatedEvent::PlacementUpdated { .. }));
        match stream.apply_stream_events(ctx, &updates, block_num) {
            Ok(()) if placement_updated && stream.is_local() => {
                self.submit_reconcile_stream_task(stream, Some(latest.clone()));
            }
            Ok(()) => (),
            Err(err) if stream.is_local() => {
                log::debug!("{}: reconciling after failed registry update: {}", stream_id, err);
                self.submit_reconcile_stream_task(stream, Some(latest.clone()));
            }
            Err(err) => log::warn!("{}: failed to apply registry update: {}", stream_id, err),
        }
    }

    fn on_stream_allocated(
        &self,
        record: &StreamRecord,
        genesis: MiniblockWithSnapshot,
    ) -> Result<(), StreamError> {
        let genesis = genesis.into_info(&MiniblockInfoOpts::new().with_expected_block_number(0))?;
        if genesis.hash() != record.last_miniblock_hash && record.last_miniblock_num == 0 {
            return Err(StreamError::bad_block(format!(
                "genesis miniblock hash {} does not match registry {}",
                genesis.hash(),
                record.last_miniblock_hash
            )));
        }
        match self.params.storage.create_stream_storage(&record.stream_id, &genesis.as_storage_mb()?) {
            Ok(()) => (),
            Err(err) if err.is_already_exists() => (),
            Err(err) => return Err(err),
        }
        self.load_or_store(record);
        Ok(())
    }

    /* ↓↓↓ Lookups ↓↓↓ */

    /// The stream, looked up in the registry if the cache does not know it yet. Never waits for the stream
    /// to be placed on this node.
    pub fn get_stream_no_wait(self: &Arc<Self>, ctx: &Context, stream_id: &StreamId) -> Result<Arc<Stream>, StreamError> {
        if let Some(stream) = self.get_loaded_stream(stream_id) {
            return Ok(stream);
        }
        let record = self.params.registry.get_stream(ctx, stream_id)?;
        let stream = self.load_or_store(&record);
        if stream.is_local() && record.last_miniblock_num > 0 {
            match self.params.storage.get_last_miniblock_number(stream_id) {
                Ok(last) if last >= record.last_miniblock_num => (),
                Ok(_) => self.submit_reconcile_stream_task(stream.clone(), Some(record)),
                Err(err) if err.is_not_found() => self.submit_reconcile_stream_task(stream.clone(), Some(record)),
                Err(err) => return Err(err),
            }
        }
        Ok(stream)
    }

    /// The stream once the registry places it on this node. Polls the registry with exponential back-off
    /// and gives up after ten seconds.
    pub fn get_stream_wait_for_local(self: &Arc<Self>, ctx: &Context, stream_id: &StreamId) -> Result<Arc<Stream>, StreamError> {
        if let Some(stream) = self.get_loaded_stream(stream_id) {
            if stream.is_local() {
                return Ok(stream);
            }
        }
        let local = self.local_address();
        let wait_ctx = ctx.child_with_timeout(WAIT_FOR_LOCAL_TIMEOUT);
        let mut delay = WAIT_FOR_LOCAL_INITIAL_DELAY;
        loop {
            match self.params.registry.get_stream(&wait_ctx, stream_id) {
                Ok(record) if record.contains(&local) => {
                    let stream = self.load_or_store(&record);
                    if !stream.is_local() {
                        stream.reset_nodes(&record);
                    }
                    return Ok(stream);
                }
                Ok(_) => (),
                Err(err) if err.is_not_found() => (),
                Err(err) => return Err(err),
            }
            if wait_ctx.sleep(delay).is_err() {
                ctx.check()?;
                return Err(StreamError::not_found(format!("stream {} is not placed on {}", stream_id, local)));
            }
            delay *= 2;
        }
    }

    /// Views of every stream that is currently loaded.
    pub fn get_loaded_views(&self) -> Vec<Arc<StreamView>> {
        self.streams.read().unwrap().values().filter_map(|stream| stream.get_view_if_loaded()).collect()
    }

    /// Local streams with events waiting that this node leads at `block_num`.
    pub fn get_mb_candidate_streams(&self, block_num: BlockNumber) -> Vec<Arc<Stream>> {
        let local = self.local_address();
        let interval = self.params.config.miniblock_leader_block_interval.max(1);
        self.streams
            .read()
            .unwrap()
            .values()
            .filter(|stream| stream.can_create_miniblock())
            .filter(|stream| {
                let quorum = stream.get_quorum_nodes();
                !quorum.is_empty() && quorum[((block_num.int() / interval) % quorum.len() as u64) as usize] == local
            })
            .cloned()
            .collect()
    }

    /// Unload streams idle for longer than `expiration`.
    pub fn cache_cleanup(&self, enabled: bool, expiration: Duration) -> CacheCleanupResult {
        let streams: Vec<Arc<Stream>> = self.streams.read().unwrap().values().cloned().collect();
        let mut result = CacheCleanupResult { total: streams.len(), ..Default::default() };
        for stream in streams {
            if !stream.is_local() {
                result.remote += 1;
                continue;
            }
            if enabled && stream.get_view_if_loaded().is_some() && stream.try_cleanup(expiration) {
                result.unloaded += 1;
            }
        }
        result
    }

    pub fn force_flush_all(&self) {
        for stream in self.streams.read().unwrap().values() {
            stream.force_flush();
        }
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.params.config
    }

    pub fn local_address(&self) -> Address {
        self.params.local_address()
    }
}

/// The events of `events` grouped by stream, streams in order of first appearance and events in block order.
fn group_by_stream(events: &[StreamUpdatedEvent]) -> Vec<(&StreamId, Vec<&StreamUpdatedEvent>)> {
    let mut groups: Vec<(&StreamId, Vec<&StreamUpdatedEvent>)> = Vec::new();
    for event in events {
        match groups.iter_mut().find(|(stream_id, _)| *stream_id == event.stream_id()) {
            Some((_, group)) => group.push(event),
            None => groups.push((event.stream_id(), vec![event])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel_genesis, mem_cache, message_event, record_for, StaticRegistry};
    use crate::types::crypto_primitives::Wallet;
    use crate::types::payloads::StreamSettings;

    #[test]
    fn allocated_stream_is_loaded_and_cleaned_up() {
        let wallet = Arc::new(Wallet::generate());
        let genesis = channel_genesis(&wallet, StreamSettings::default());
        let stream_id = StreamView::from_genesis(Arc::new(genesis.clone())).unwrap().stream_id().clone();
        let record = record_for(&stream_id, vec![wallet.address()], &genesis);
        let registry = Arc::new(StaticRegistry::default());
        registry.add(record.clone(), &genesis);
        let cache = mem_cache(wallet.clone(), registry);
        let ctx = Context::background();

        // 1. Allocation creates storage and registers the stream.
        cache.on_block(
            &ctx,
            &RegistryBlock {
                number: BlockNumber::new(1),
                events: vec![StreamUpdatedEvent::Allocated {
                    record: record.clone(),
                    genesis_miniblock: MiniblockWithSnapshot::from_info(&genesis),
                }],
            },
        );
        let stream = cache.get_stream_no_wait(&ctx, &stream_id).unwrap();
        assert_eq!(stream.get_view(&ctx).unwrap().last_block_num(), 0);
        assert_eq!(cache.get_loaded_views().len(), 1);

        // 2. A stream with events waiting is a candidate for production when this node leads.
        stream.add_event(&ctx, message_event(&wallet, &genesis, "hello")).unwrap();
        assert_eq!(cache.get_mb_candidate_streams(BlockNumber::new(1)).len(), 1);

        // 3. Pending events keep the view loaded. An empty minipool lets it go.
        assert_eq!(cache.cache_cleanup(true, Duration::ZERO), CacheCleanupResult { total: 1, unloaded: 0, remote: 0 });
        cache.force_flush_all();
        assert!(cache.get_loaded_views().is_empty());

        cache.stop();
    }

    #[test]
    fn confirmations_in_one_block_are_all_applied() {
        let wallet = Arc::new(Wallet::generate());
        let genesis = channel_genesis(&wallet, StreamSettings::default());
        let stream_id = StreamView::from_genesis(Arc::new(genesis.clone())).unwrap().stream_id().clone();
        let nodes = vec![wallet.address()];
        let registry = Arc::new(StaticRegistry::default());
        registry.add(record_for(&stream_id, nodes.clone(), &genesis), &genesis);
        let cache = mem_cache(wallet.clone(), registry);
        let ctx = Context::background();
        let config = StreamConfig::default();

        // 1. Save the candidates for miniblocks 1 and 2.
        let stream = cache.get_stream_no_wait(&ctx, &stream_id).unwrap();
        stream.add_event(&ctx, message_event(&wallet, &genesis, "hello")).unwrap();
        let view = stream.get_view(&ctx).unwrap();
        let first = view.make_miniblock_candidate(&wallet, &view.local_proposal(&config, false), &config).unwrap();
        let (next, _) = view.copy_and_apply_block(Arc::new(first.clone()), &config).unwrap();
        let second = next.make_miniblock_candidate(&wallet, &next.local_proposal(&config, true), &config).unwrap();
        stream.save_miniblock_candidate(&ctx, Arc::new(first.clone())).unwrap();
        stream.save_miniblock_candidate(&ctx, Arc::new(second.clone())).unwrap();
        assert_eq!(stream.get_view(&ctx).unwrap().last_block_num(), 0);

        // 2. The registry confirms both in the same block. Both are promoted.
        let block = RegistryBlock {
            number: BlockNumber::new(5),
            events: vec![
                StreamUpdatedEvent::LastMiniblockBatchUpdated { record: record_for(&stream_id, nodes.clone(), &first) },
                StreamUpdatedEvent::LastMiniblockBatchUpdated { record: record_for(&stream_id, nodes, &second) },
            ],
        };
        cache.on_block(&ctx, &block);
        assert_eq!(stream.get_view(&ctx).unwrap().last_block_ref(), second.miniblock_ref);
        assert!(stream.pending_candidates().is_empty());

        // 3. The same block again is ignored.
        cache.on_block(&ctx, &block);
        assert_eq!(stream.get_last_miniblock_num_skip_load().unwrap(), 2);

        cache.stop();
    }

    #[test]
    fn stream_placed_elsewhere_is_remote() {
        let wallet = Arc::new(Wallet::generate());
        let other = Wallet::generate();
        let genesis = channel_genesis(&other, StreamSettings::default());
        let stream_id = StreamView::from_genesis(Arc::new(genesis.clone())).unwrap().stream_id().clone();
        let registry = Arc::new(StaticRegistry::default());
        registry.add(record_for(&stream_id, vec![other.address()], &genesis), &genesis);
        let cache = mem_cache(wallet, registry);
        let ctx = Context::background();

        let stream = cache.get_stream_no_wait(&ctx, &stream_id).unwrap();
        assert!(!stream.is_local());
        assert!(stream.get_view(&ctx).unwrap_err().is_not_found());
        assert_eq!(cache.cache_cleanup(true, Duration::ZERO).remote, 1);

        match cache.get_stream_wait_for_local(&Context::with_timeout(Duration::from_millis(100)), &stream_id) {
            Err(err) => assert!(err.is_cancellation() || err.is_not_found()),
            Ok(_) => panic!("stream placed elsewhere was reported local"),
        }

        cache.stop();
    }
}
