/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Registry) for the external ledger that places streams on nodes and finalizes their
//! miniblocks, and the events it emits.
//!
//! The registry is the source of truth for which nodes hold a stream and which miniblock is its last. Nodes
//! commit candidates to it in batches with [`Registry::set_stream_last_miniblock_batch`], and learn about
//! commitments, new streams, and placement changes by polling [`Registry::blocks_since`].

use crate::context::Context;
use crate::errors::StreamError;
use crate::networking::MiniblockWithSnapshot;
use crate::types::data_types::{Address, BlockNumber, CryptoHash, MiniblockRef, StreamId};
use crate::types::stream_record::StreamRecord;

pub trait Registry: Send + Sync {
    fn get_stream(&self, ctx: &Context, stream_id: &StreamId) -> Result<StreamRecord, StreamError>;

    /// The record together with the stream's genesis miniblock and its hash.
    fn get_stream_with_genesis(&self, ctx: &Context, stream_id: &StreamId) -> Result<StreamWithGenesis, StreamError>;

    /// Every stream placed on `node`.
    fn get_streams_on_node(&self, ctx: &Context, node: &Address) -> Result<Vec<StreamRecord>, StreamError>;

    /// Commit a batch of new last miniblocks. Each entry succeeds, is rejected as invalid (it does not
    /// extend the registry's last miniblock), or fails.
    fn set_stream_last_miniblock_batch(
        &self,
        ctx: &Context,
        miniblocks: &[SetMiniblock],
    ) -> Result<SetMiniblockBatchResult, StreamError>;

    /// Blocks after `after`, in order. `None` returns every block still retained.
    fn blocks_since(&self, ctx: &Context, after: Option<BlockNumber>) -> Result<Vec<RegistryBlock>, StreamError>;
}

#[derive(Clone, Debug)]
pub struct StreamWithGenesis {
    pub record: StreamRecord,
    pub genesis_miniblock_hash: CryptoHash,
    pub genesis_miniblock: MiniblockWithSnapshot,
}

/// A request to move a stream's last miniblock from `prev_miniblock_hash` to `last_miniblock`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMiniblock {
    pub stream_id: StreamId,
    pub prev_miniblock_hash: CryptoHash,
    pub last_miniblock: MiniblockRef,
    pub is_sealed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetMiniblockBatchResult {
    pub success: Vec<StreamId>,
    pub invalid: Vec<StreamId>,
    pub failed: Vec<StreamId>,
}

/// One block of the registry and the stream events it carries.
#[derive(Clone, Debug)]
pub struct RegistryBlock {
    pub number: BlockNumber,
    pub events: Vec<StreamUpdatedEvent>,
}

#[derive(Clone, Debug)]
pub enum StreamUpdatedEvent {
    /// A new stream was placed on its nodes.
    Allocated { record: StreamRecord, genesis_miniblock: MiniblockWithSnapshot },

    /// A stream whose miniblocks were uploaded before registration was created. Its storage is
    /// ephemeral until every miniblock is present.
    Created { record: StreamRecord },

    PlacementUpdated { record: StreamRecord },

    /// Last miniblocks committed for one or more streams.
    LastMiniblockBatchUpdated { record: StreamRecord },
}

impl StreamUpdatedEvent {
    pub fn stream_id(&self) -> &StreamId {
        match self {
            StreamUpdatedEvent::Allocated { record, .. }
            | StreamUpdatedEvent::Created { record }
            | StreamUpdatedEvent::PlacementUpdated { record }
            | StreamUpdatedEvent::LastMiniblockBatchUpdated { record } => &record.stream_id,
        }
    }

    pub fn record(&self) -> &StreamRecord {
        match self {
            StreamUpdatedEvent::Allocated { record, .. }
            | StreamUpdatedEvent::Created { record }
            | StreamUpdatedEvent::PlacementUpdated { record }
            | StreamUpdatedEvent::LastMiniblockBatchUpdated { record } => record,
        }
    }
}
