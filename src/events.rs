/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of streamlog events for event handling and logging.
//! Note: an event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::data_types::{BlockNumber, CryptoHash, MiniblockRef, StreamId};

pub enum Event {
    // Events that change a stream.
    AddEvent(AddEventEvent),
    ApplyMiniblock(ApplyMiniblockEvent),
    PromoteCandidate(PromoteCandidateEvent),
    SaveCandidate(SaveCandidateEvent),
    // Miniblock production events.
    ProduceCandidate(ProduceCandidateEvent),
    SkipCandidate(SkipCandidateEvent),
    QuorumFailed(QuorumFailedEvent),
    // Reconciliation events.
    StartReconcile(StartReconcileEvent),
    EndReconcile(EndReconcileEvent),
    ReconcileRetryQueued(ReconcileRetryQueuedEvent),
    // Cache events.
    LoadStream(LoadStreamEvent),
    UnloadStream(UnloadStreamEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only goes away on shutdown, when there is nobody left to tell.
            let _ = event_publisher.send(event);
        }
    }
}

pub struct AddEventEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub event: CryptoHash,
    pub generation: i64,
}

pub struct ApplyMiniblockEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub miniblock: MiniblockRef,
    pub events: usize,
    pub has_snapshot: bool,
}

pub struct PromoteCandidateEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub candidate: MiniblockRef,
}

pub struct SaveCandidateEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub candidate: MiniblockRef,
}

pub struct ProduceCandidateEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub candidate: MiniblockRef,
    pub events: usize,
    /// Number of proposals combined, the local one included.
    pub proposals: usize,
}

pub struct SkipCandidateEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub block_num: BlockNumber,
    pub candidate_count: usize,
}

pub struct QuorumFailedEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub succeeded: usize,
    pub needed: usize,
    pub total: usize,
}

pub struct StartReconcileEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub expected_last: i64,
}

pub struct EndReconcileEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub forward_miniblocks: usize,
    pub backfill_miniblocks: usize,
    pub reinitialized: bool,
}

pub struct ReconcileRetryQueuedEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub expected_last: i64,
    pub error: String,
}

pub struct LoadStreamEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub last_miniblock: MiniblockRef,
}

pub struct UnloadStreamEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
}
