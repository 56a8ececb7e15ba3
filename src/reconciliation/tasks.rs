/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Scheduling of reconciliation.
//!
//! At most one reconciliation runs per stream. Requests that arrive while one is running are coalesced
//! into a single follow-up that runs when the current one finishes. Reconciliations that fail with a
//! retryable error are parked in the [`RetryQueue`] and resubmitted by
//! [`StreamCache::process_reconcile_retries`] once their retry time has passed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use crate::events::{Event, ReconcileRetryQueuedEvent};
use crate::stream::Stream;
use crate::stream_cache::{PoolKind, StreamCache};
use crate::types::data_types::StreamId;
use crate::types::stream_record::StreamRecord;

use super::reconciler::StreamReconciler;

/// What a reconciliation works towards. `None` means the latest record in the registry.
pub(crate) type ReconcileTarget = Option<StreamRecord>;

/// Of two targets, the one that reaches further. A registry lookup reaches furthest.
fn further(current: ReconcileTarget, candidate: ReconcileTarget) -> ReconcileTarget {
    match (current, candidate) {
        (None, _) | (_, None) => None,
        (Some(current), Some(candidate)) => {
            if candidate.last_miniblock_num > current.last_miniblock_num {
                Some(candidate)
            } else {
                Some(current)
            }
        }
    }
}

struct QueuedTask {
    /// Set while a follow-up is waiting for the running task.
    next: Option<ReconcileTarget>,
}

/// Per-stream bookkeeping of running reconciliations.
pub(crate) struct ReconcileTaskQueue {
    tasks: Mutex<HashMap<StreamId, QueuedTask>>,
}

impl ReconcileTaskQueue {
    pub(crate) fn new() -> ReconcileTaskQueue {
        ReconcileTaskQueue { tasks: Mutex::new(HashMap::new()) }
    }

    /// Register a request. Returns true if no task is running for the stream, in which case the caller
    /// must start one. Otherwise the request is folded into the follow-up.
    pub(crate) fn enqueue(&self, stream_id: &StreamId, target: &ReconcileTarget) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(stream_id) {
            Some(task) => {
                task.next = Some(match task.next.take() {
                    Some(next) => further(next, target.clone()),
                    None => target.clone(),
                });
                false
            }
            None => {
                tasks.insert(stream_id.clone(), QueuedTask { next: None });
                true
            }
        }
    }

    /// Mark the running task done. Returns the follow-up to run next, if any, which is then considered
    /// running.
    pub(crate) fn finish(&self, stream_id: &StreamId) -> Option<ReconcileTarget> {
        let mut tasks = self.tasks.lock().unwrap();
        let next = tasks.get_mut(stream_id).and_then(|task| task.next.take());
        if next.is_none() {
            tasks.remove(stream_id);
        }
        next
    }

    pub(crate) fn is_running(&self, stream_id: &StreamId) -> bool {
        self.tasks.lock().unwrap().contains_key(stream_id)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RetryItem {
    pub(crate) stream_id: StreamId,
    pub(crate) target: ReconcileTarget,
    pub(crate) expected_last: i64,
    pub(crate) retry_after: Instant,
}

#[derive(Default)]
struct RetryQueueInner {
    order: VecDeque<StreamId>,
    items: HashMap<StreamId, RetryItem>,
}

/// Streams waiting to be reconciled again, in the order they failed.
pub(crate) struct RetryQueue {
    inner: Mutex<RetryQueueInner>,
}

impl RetryQueue {
    pub(crate) fn new() -> RetryQueue {
        RetryQueue { inner: Mutex::new(RetryQueueInner::default()) }
    }

    /// Queue `item`. A stream that is already queued keeps its place, and its item is replaced only if
    /// `item` expects a later miniblock.
    pub(crate) fn add(&self, item: RetryItem) {
        let mut inner = self.inner.lock().unwrap();
        match inner.items.get_mut(&item.stream_id) {
            Some(existing) => {
                if item.expected_last > existing.expected_last {
                    existing.target = item.target;
                    existing.expected_last = item.expected_last;
                }
            }
            None => {
                inner.order.push_back(item.stream_id.clone());
                inner.items.insert(item.stream_id.clone(), item);
            }
        }
    }

    /// Drop the queued retry of a stream that reached `expected_last`, unless the retry expects more.
    pub(crate) fn remove(&self, stream_id: &StreamId, expected_last: i64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.get(stream_id).map_or(false, |item| item.expected_last <= expected_last) {
            inner.items.remove(stream_id);
            inner.order.retain(|queued| queued != stream_id);
        }
    }

    pub(crate) fn peek(&self) -> Option<RetryItem> {
        let inner = self.inner.lock().unwrap();
        inner.order.front().and_then(|stream_id| inner.items.get(stream_id)).cloned()
    }

    pub(crate) fn pop(&self) -> Option<RetryItem> {
        let mut inner = self.inner.lock().unwrap();
        let stream_id = inner.order.pop_front()?;
        inner.items.remove(&stream_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}

impl StreamCache {
    /// Reconcile `stream` on the online pool, towards `target`.
    pub(crate) fn submit_reconcile_stream_task(self: &Arc<Self>, stream: Arc<Stream>, target: ReconcileTarget) {
        self.submit_reconcile_task_to_pool(PoolKind::Online, stream, target)
    }

    pub(crate) fn submit_reconcile_task_to_pool(self: &Arc<Self>, pool: PoolKind, stream: Arc<Stream>, target: ReconcileTarget) {
        if !self.reconcile_tasks.enqueue(stream.stream_id(), &target) {
            return;
        }
        self.spawn_reconcile_task(pool, stream, target);
    }

    fn spawn_reconcile_task(self: &Arc<Self>, pool: PoolKind, stream: Arc<Stream>, target: ReconcileTarget) {
        let cache = self.clone();
        self.submit(pool, move || {
            cache.run_reconcile_task(&stream, target);
            if let Some(next) = cache.reconcile_tasks.finish(stream.stream_id()) {
                cache.spawn_reconcile_task(pool, stream, next);
            }
        });
    }

    fn run_reconcile_task(self: &Arc<Self>, stream: &Arc<Stream>, target: ReconcileTarget) {
        let ctx = self.server_ctx.child();
        let record = match &target {
            Some(record) => record.clone(),
            None => match self.params.registry.get_stream(&ctx, stream.stream_id()) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("{}: failed to read registry record for reconciliation: {}", stream.stream_id(), err);
                    return;
                }
            },
        };
        let expected_last = record.last_miniblock_num;

        match StreamReconciler::new(self, &ctx, stream.clone(), record).reconcile() {
            Ok(_) => self.retry_queue.remove(stream.stream_id(), expected_last),
            Err(err) if err.is_retryable() => {
                log::info!("{}: reconciliation to {} will be retried: {}", stream.stream_id(), expected_last, err);
                self.retry_queue.add(RetryItem {
                    stream_id: stream.stream_id().clone(),
                    target,
                    expected_last,
                    retry_after: Instant::now() + self.settings.retry_reconciliation_interval,
                });
                Event::publish(
                    &self.params.event_publisher,
                    Event::ReconcileRetryQueued(ReconcileRetryQueuedEvent {
                        timestamp: SystemTime::now(),
                        stream_id: stream.stream_id().clone(),
                        expected_last,
                        error: err.to_string(),
                    }),
                );
            }
            Err(err) if err.is_cancellation() => (),
            Err(err) => log::warn!("{}: reconciliation to {} failed: {}", stream.stream_id(), expected_last, err),
        }
    }

    /// Resubmit every queued retry whose time has come. Returns the number resubmitted.
    pub(crate) fn process_reconcile_retries(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let mut resubmitted = 0;
        while let Some(item) = self.retry_queue.peek() {
            if item.retry_after > now {
                break;
            }
            let item = match self.retry_queue.pop() {
                Some(item) => item,
                None => break,
            };
            if let Some(stream) = self.get_loaded_stream(&item.stream_id) {
                self.submit_reconcile_stream_task(stream, item.target);
                resubmitted += 1;
            }
        }
        resubmitted
    }
}
