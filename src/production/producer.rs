/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Drives [`MbJob`]s on every registry block, and registers the resulting candidates with the registry.
//!
//! ## Lifecycle of a candidate
//!
//! 1. On each registry block the producer asks the [`StreamCache`] for the streams this node leads and that
//!    have events to seal, and queues one job per stream on its worker pool. A stream never has more than
//!    one job in flight.
//! 2. A job that produced a candidate hands it to the candidate tracker, which registers candidates in
//!    batches with [`Registry::set_stream_last_miniblock_batch`](crate::registry::Registry). Candidates of
//!    non-replicated streams that carry no snapshot skip the registry and are applied right away.
//! 3. Once the registry answered, a successful candidate is applied, an invalid one makes the stream promote
//!    whatever the registry holds instead, and a failed one is dropped. The stream's job slot is then freed.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::context::Context;
use crate::errors::{ErrorCode, StreamError};
use crate::registry::SetMiniblock;
use crate::stream::Stream;
use crate::stream_cache::StreamCache;
use crate::types::data_types::{BlockNumber, MiniblockRef, StreamId};
use crate::types::miniblock::MiniblockInfo;
use crate::worker_pool::WorkerPool;

use super::candidate_tracker::CandidateTracker;
use super::job::MbJob;

type Registration = (Arc<Stream>, Arc<MiniblockInfo>);

pub struct MiniblockProducer {
    cache: Arc<StreamCache>,
    jobs: Mutex<HashSet<StreamId>>,
    job_done: Condvar,
    workers: WorkerPool,
    tracker: CandidateTracker<Registration>,
}

impl MiniblockProducer {
    pub(crate) fn new(cache: Arc<StreamCache>, workers: usize) -> Arc<MiniblockProducer> {
        let batch_size = cache.stream_config().miniblock_candidate_batch_size;
        let flush_after = cache.settings.block_time / 4;
        Arc::new_cyclic(|producer: &Weak<MiniblockProducer>| {
            let producer = producer.clone();
            MiniblockProducer {
                cache,
                jobs: Mutex::new(HashSet::new()),
                job_done: Condvar::new(),
                workers: WorkerPool::new("miniblock_jobs", workers),
                tracker: CandidateTracker::new(
                    batch_size,
                    flush_after,
                    Arc::new(move |batch: Vec<Registration>| {
                        if let Some(producer) = producer.upgrade() {
                            producer.register_batch(batch);
                        }
                    }),
                ),
            }
        })
    }

    /// Queue a job for every stream this node leads in `block_num`. Returns once the jobs are queued.
    pub fn on_new_block(self: &Arc<Self>, block_num: BlockNumber) {
        let mut scheduled = 0;
        for stream in self.cache.get_mb_candidate_streams(block_num) {
            if self.try_schedule(stream, block_num) {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            log::debug!("block {}: scheduled {} miniblock jobs", block_num, scheduled);
        }
    }

    fn try_schedule(self: &Arc<Self>, stream: Arc<Stream>, block_num: BlockNumber) -> bool {
        let stream_id = stream.stream_id().clone();
        if !self.jobs.lock().unwrap().insert(stream_id.clone()) {
            return false;
        }
        let producer = self.clone();
        if !self.workers.submit(move || producer.run_job(stream, block_num)) {
            self.finish_job(&stream_id);
            return false;
        }
        true
    }

    /// Refuse new jobs, then wait for the queued ones and for the registration of their candidates.
    pub(crate) fn stop(&self) {
        self.workers.stop();
        self.tracker.stop();
    }

    /// Number of streams with a job queued or running.
    pub fn jobs_in_flight(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn run_job(self: &Arc<Self>, stream: Arc<Stream>, block_num: BlockNumber) {
        let ctx = self.cache.server_ctx.child();
        let job = MbJob::new(self.cache.clone(), stream.clone(), block_num, false);
        match job.run(&ctx) {
            Ok(Some(candidate)) => {
                if !job.is_replicated() && !candidate.has_snapshot() {
                    if let Err(err) = stream.apply_miniblock(&ctx, candidate.clone()) {
                        log::warn!("{}: failed to apply candidate {}: {}", stream.stream_id(), candidate.miniblock_ref, err);
                    }
                    self.finish_job(stream.stream_id());
                } else {
                    self.tracker.add((stream, candidate));
                }
            }
            Ok(None) => self.finish_job(stream.stream_id()),
            Err(err) => {
                match err.code() {
                    ErrorCode::ResourceExhausted | ErrorCode::MiniblockTooOld => {
                        log::debug!("{}: no candidate in block {}: {}", stream.stream_id(), block_num, err)
                    }
                    _ if err.is_cancellation() => (),
                    _ => log::warn!("{}: miniblock job in block {} failed: {}", stream.stream_id(), block_num, err),
                }
                self.finish_job(stream.stream_id());
            }
        }
    }

    fn finish_job(&self, stream_id: &StreamId) {
        self.jobs.lock().unwrap().remove(stream_id);
        self.job_done.notify_all();
    }

    fn register_batch(&self, batch: Vec<Registration>) {
        let ctx = self.cache.server_ctx.child();
        let stream_ids: Vec<StreamId> = batch.iter().map(|(stream, _)| stream.stream_id().clone()).collect();
        if let Err(err) = self.register_candidates(&ctx, batch) {
            log::warn!("failed to register {} candidates: {}", stream_ids.len(), err);
        }
        for stream_id in &stream_ids {
            self.finish_job(stream_id);
        }
    }

    /// Register `batch` with the registry and act on the outcome of every entry. Returns the outcome per
    /// entry, in order, unless the registry call itself failed.
    fn register_candidates(&self, ctx: &Context, batch: Vec<Registration>) -> Result<Vec<Result<(), StreamError>>, StreamError> {
        let request: Vec<SetMiniblock> = batch
            .iter()
            .map(|(stream, candidate)| SetMiniblock {
                stream_id: stream.stream_id().clone(),
                prev_miniblock_hash: candidate.header().prev_miniblock_hash,
                last_miniblock: candidate.miniblock_ref,
                is_sealed: false,
            })
            .collect();
        let result = self.cache.params.registry.set_stream_last_miniblock_batch(ctx, &request)?;

        let outcomes = batch
            .into_iter()
            .map(|(stream, candidate)| {
                let stream_id = stream.stream_id();
                if result.success.contains(stream_id) {
                    stream.apply_miniblock(ctx, candidate.clone()).or_else(|err| {
                        log::warn!("{}: failed to apply registered candidate {}: {}", stream_id, candidate.miniblock_ref, err);
                        self.cache.submit_reconcile_stream_task(stream.clone(), None);
                        Err(err)
                    })
                } else if result.invalid.contains(stream_id) {
                    self.promote_registered(ctx, &stream)?;
                    Err(StreamError::MiniblockTooOld {
                        stream_id: stream_id.clone(),
                        requested: candidate.num(),
                        local: stream.get_view(ctx).map(|view| view.generation()).unwrap_or(-1),
                    })
                } else {
                    log::warn!("{}: registry failed to register candidate {}", stream_id, candidate.miniblock_ref);
                    Err(StreamError::Unavailable {
                        reason: format!("registry failed to register candidate {}", candidate.miniblock_ref),
                        errors: Vec::new(),
                    })
                }
            })
            .collect();
        Ok(outcomes)
    }

    /// The registry rejected a candidate: move the stream to whatever the registry committed instead.
    fn promote_registered(&self, ctx: &Context, stream: &Arc<Stream>) -> Result<(), StreamError> {
        let record = self.cache.params.registry.get_stream(ctx, stream.stream_id())?;
        if let Err(err) = stream.promote_candidate(ctx, record.last_miniblock()) {
            log::info!("{}: cannot promote {} from the registry, reconciling: {}", stream.stream_id(), record.last_miniblock(), err);
            self.cache.submit_reconcile_stream_task(stream.clone(), Some(record));
        }
        Ok(())
    }

    /// Produce and register a miniblock for `stream_id` now, bypassing leader election and throttling.
    /// Waits for a job already in flight for the stream. Returns `None` if there was nothing to seal.
    pub fn make_miniblock(&self, ctx: &Context, stream_id: &StreamId, force_snapshot: bool) -> Result<Option<MiniblockRef>, StreamError> {
        let stream = self.cache.get_stream_no_wait(ctx, stream_id)?;
        if !stream.is_local_in_quorum() {
            return Err(StreamError::invalid_argument(format!("{} is not in the quorum of {}", self.cache.local_address(), stream_id)));
        }

        {
            let mut jobs = self.jobs.lock().unwrap();
            while jobs.contains(stream_id) {
                ctx.check()?;
                let (guard, _) = self.job_done.wait_timeout(jobs, Duration::from_millis(50)).unwrap();
                jobs = guard;
            }
            jobs.insert(stream_id.clone());
        }
        let result = self.make_miniblock_locked(ctx, stream, force_snapshot);
        self.finish_job(stream_id);
        result
    }

    fn make_miniblock_locked(&self, ctx: &Context, stream: Arc<Stream>, force_snapshot: bool) -> Result<Option<MiniblockRef>, StreamError> {
        let job = MbJob::new(self.cache.clone(), stream.clone(), BlockNumber::new(0), force_snapshot);
        let candidate = match job.run(ctx)? {
            Some(candidate) => candidate,
            None => return Ok(None),
        };
        let miniblock_ref = candidate.miniblock_ref;
        if !job.is_replicated() && !candidate.has_snapshot() {
            stream.apply_miniblock(ctx, candidate)?;
            return Ok(Some(miniblock_ref));
        }
        let mut outcomes = self.register_candidates(ctx, vec![(stream, candidate)])?;
        match outcomes.pop() {
            Some(Ok(())) => Ok(Some(miniblock_ref)),
            Some(Err(err)) => Err(err),
            None => Err(StreamError::internal("registry returned no outcome")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamView;
    use crate::testing::{channel_genesis, mem_cache, message_event, record_for, StaticRegistry};
    use crate::types::crypto_primitives::Wallet;
    use crate::types::payloads::StreamSettings;

    #[test]
    fn stop_waits_for_queued_jobs() {
        let wallet = Arc::new(Wallet::generate());
        let genesis = channel_genesis(&wallet, StreamSettings::default());
        let stream_id = StreamView::from_genesis(Arc::new(genesis.clone())).unwrap().stream_id().clone();
        let registry = Arc::new(StaticRegistry::default());
        registry.add(record_for(&stream_id, vec![wallet.address()], &genesis), &genesis);
        let cache = mem_cache(wallet.clone(), registry);
        let ctx = Context::background();

        // 1. A stream only this node holds, with one event to seal.
        let stream = cache.get_stream_no_wait(&ctx, &stream_id).unwrap();
        stream.add_event(&ctx, message_event(&wallet, &genesis, "hello")).unwrap();

        // 2. Queue its job on a single worker, then stop the producer.
        let producer = MiniblockProducer::new(cache.clone(), 1);
        producer.on_new_block(BlockNumber::new(1));
        producer.stop();

        // 3. The job ran to completion before `stop` returned.
        assert_eq!(producer.jobs_in_flight(), 0);
        assert_eq!(stream.get_view(&ctx).unwrap().last_block_num(), 1);

        // 4. A stopped producer queues nothing.
        stream.add_event(&ctx, message_event(&wallet, &genesis, "late")).unwrap();
        producer.on_new_block(BlockNumber::new(2));
        assert_eq!(producer.jobs_in_flight(), 0);
        assert_eq!(stream.get_view(&ctx).unwrap().minipool().len(), 1);

        cache.stop();
    }
}
