/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [configuration](crate::config::NodeConfiguration).
//!
//! streamlog logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how an [ApplyMiniblock](crate::events::ApplyMiniblockEvent) is printed:
//!
//! ```text
//! ApplyMiniblock, 1701329264, IGsFLmw, fNGCJyk, 12, 3, false
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the stream id.
//! - The fourth value is the first seven characters of the Base64 encoding of the miniblock hash.
//! - The fifth value is the miniblock number, the sixth its number of events, and the last whether it
//!   carries a snapshot.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const ADD_EVENT: &str = "AddEvent";
pub const APPLY_MINIBLOCK: &str = "ApplyMiniblock";
pub const PROMOTE_CANDIDATE: &str = "PromoteCandidate";
pub const SAVE_CANDIDATE: &str = "SaveCandidate";

pub const PRODUCE_CANDIDATE: &str = "ProduceCandidate";
pub const SKIP_CANDIDATE: &str = "SkipCandidate";
pub const QUORUM_FAILED: &str = "QuorumFailed";

pub const START_RECONCILE: &str = "StartReconcile";
pub const END_RECONCILE: &str = "EndReconcile";
pub const RECONCILE_RETRY_QUEUED: &str = "ReconcileRetryQueued";

pub const LOAD_STREAM: &str = "LoadStream";
pub const UNLOAD_STREAM: &str = "UnloadStream";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for AddEventEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |add_event_event: &AddEventEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}",
                ADD_EVENT,
                secs_since_unix_epoch(add_event_event.timestamp),
                first_seven_base64_chars(add_event_event.stream_id.bytes()),
                first_seven_base64_chars(&add_event_event.event.bytes()),
                add_event_event.generation
            )
        };
        Box::new(logger)
    }
}

impl Logger for ApplyMiniblockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |apply_miniblock_event: &ApplyMiniblockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                APPLY_MINIBLOCK,
                secs_since_unix_epoch(apply_miniblock_event.timestamp),
                first_seven_base64_chars(apply_miniblock_event.stream_id.bytes()),
                first_seven_base64_chars(&apply_miniblock_event.miniblock.hash.bytes()),
                apply_miniblock_event.miniblock.num,
                apply_miniblock_event.events,
                apply_miniblock_event.has_snapshot
            )
        };
        Box::new(logger)
    }
}

impl Logger for PromoteCandidateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |promote_candidate_event: &PromoteCandidateEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROMOTE_CANDIDATE,
                secs_since_unix_epoch(promote_candidate_event.timestamp),
                first_seven_base64_chars(promote_candidate_event.stream_id.bytes()),
                first_seven_base64_chars(&promote_candidate_event.candidate.hash.bytes()),
                promote_candidate_event.candidate.num
            )
        };
        Box::new(logger)
    }
}

impl Logger for SaveCandidateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |save_candidate_event: &SaveCandidateEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SAVE_CANDIDATE,
                secs_since_unix_epoch(save_candidate_event.timestamp),
                first_seven_base64_chars(save_candidate_event.stream_id.bytes()),
                first_seven_base64_chars(&save_candidate_event.candidate.hash.bytes()),
                save_candidate_event.candidate.num
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProduceCandidateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |produce_candidate_event: &ProduceCandidateEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                PRODUCE_CANDIDATE,
                secs_since_unix_epoch(produce_candidate_event.timestamp),
                first_seven_base64_chars(produce_candidate_event.stream_id.bytes()),
                first_seven_base64_chars(&produce_candidate_event.candidate.hash.bytes()),
                produce_candidate_event.candidate.num,
                produce_candidate_event.events,
                produce_candidate_event.proposals
            )
        };
        Box::new(logger)
    }
}

impl Logger for SkipCandidateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |skip_candidate_event: &SkipCandidateEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SKIP_CANDIDATE,
                secs_since_unix_epoch(skip_candidate_event.timestamp),
                first_seven_base64_chars(skip_candidate_event.stream_id.bytes()),
                skip_candidate_event.block_num,
                skip_candidate_event.candidate_count
            )
        };
        Box::new(logger)
    }
}

impl Logger for QuorumFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |quorum_failed_event: &QuorumFailedEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}",
                QUORUM_FAILED,
                secs_since_unix_epoch(quorum_failed_event.timestamp),
                quorum_failed_event.name,
                quorum_failed_event.succeeded,
                quorum_failed_event.needed,
                quorum_failed_event.total
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartReconcileEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_reconcile_event: &StartReconcileEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_RECONCILE,
                secs_since_unix_epoch(start_reconcile_event.timestamp),
                first_seven_base64_chars(start_reconcile_event.stream_id.bytes()),
                start_reconcile_event.expected_last
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndReconcileEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_reconcile_event: &EndReconcileEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                END_RECONCILE,
                secs_since_unix_epoch(end_reconcile_event.timestamp),
                first_seven_base64_chars(end_reconcile_event.stream_id.bytes()),
                end_reconcile_event.forward_miniblocks,
                end_reconcile_event.backfill_miniblocks,
                end_reconcile_event.reinitialized
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReconcileRetryQueuedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |retry_queued_event: &ReconcileRetryQueuedEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                RECONCILE_RETRY_QUEUED,
                secs_since_unix_epoch(retry_queued_event.timestamp),
                first_seven_base64_chars(retry_queued_event.stream_id.bytes()),
                retry_queued_event.expected_last,
                retry_queued_event.error
            )
        };
        Box::new(logger)
    }
}

impl Logger for LoadStreamEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |load_stream_event: &LoadStreamEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}",
                LOAD_STREAM,
                secs_since_unix_epoch(load_stream_event.timestamp),
                first_seven_base64_chars(load_stream_event.stream_id.bytes()),
                first_seven_base64_chars(&load_stream_event.last_miniblock.hash.bytes()),
                load_stream_event.last_miniblock.num
            )
        };
        Box::new(logger)
    }
}

impl Logger for UnloadStreamEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |unload_stream_event: &UnloadStreamEvent| {
            log::debug!(
                "{}, {}, {}",
                UNLOAD_STREAM,
                secs_since_unix_epoch(unload_stream_event.timestamp),
                first_seven_base64_chars(unload_stream_event.stream_id.bytes())
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
