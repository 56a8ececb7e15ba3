/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](RemoteMiniblockProvider) for pluggable peer-to-peer requests, the request and response
//! types that travel over it, and the [handler](StreamServiceHandler) that answers them.
//!
//! Peers are addressed by their node [`Address`]. A transport implements `RemoteMiniblockProvider` by
//! delivering each request to the named peer and handing it to that peer's `StreamServiceHandler`. Every
//! request is idempotent, so transports and callers may retry freely.

use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::context::Context;
use crate::errors::StreamError;
use crate::stream::view::{MbProposal, StreamAndCookie};
use crate::stream_cache::StreamCache;
use crate::types::data_types::{Address, CryptoHash, MiniblockRef, StreamId};
use crate::types::envelope::Envelope;
use crate::types::miniblock::{Miniblock, MiniblockInfo, MiniblockInfoOpts};

pub trait RemoteMiniblockProvider: Send + Sync {
    /// Ask `node` for its proposal for the next miniblock of a stream.
    fn get_mb_proposal(
        &self,
        ctx: &Context,
        node: &Address,
        request: ProposeMiniblockRequest,
    ) -> Result<ProposeMiniblockResponse, StreamError>;

    /// Store a candidate miniblock on `node`.
    fn save_mb_candidate(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        candidate: MiniblockWithSnapshot,
    ) -> Result<(), StreamError>;

    /// Fetch the contiguous run of miniblocks in `[from_inclusive, to_exclusive)` that `node` has.
    fn get_mbs(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<GetMiniblocksResponse, StreamError>;

    /// Fetch specific miniblocks. Numbers `node` does not have are left out of the response.
    fn get_mbs_by_ids(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        nums: Vec<i64>,
    ) -> Result<Vec<MiniblockWithSnapshot>, StreamError>;

    fn get_last_miniblock_hash(&self, ctx: &Context, node: &Address, stream_id: &StreamId) -> Result<MiniblockRef, StreamError>;

    /// Fetch everything needed to reinitialize a stream: miniblocks from the last snapshot, up to
    /// `num_preceding` miniblocks before it, and the minipool.
    fn get_stream(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        num_preceding: i64,
    ) -> Result<StreamAndCookie, StreamError>;
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ProposeMiniblockRequest {
    pub stream_id: StreamId,
    pub new_miniblock_num: i64,
    pub prev_miniblock_hash: CryptoHash,
    /// Hashes the requester already has, so the response only carries the events it lacks.
    pub local_event_hashes: Vec<CryptoHash>,
    pub force_snapshot: bool,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ProposeMiniblockResponse {
    pub proposal: MbProposal,
    pub missing_events: Vec<Envelope>,
}

/// A miniblock as it travels between nodes and through the registry.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MiniblockWithSnapshot {
    pub miniblock: Miniblock,
    pub snapshot: Option<Envelope>,
}

impl MiniblockWithSnapshot {
    pub fn from_info(info: &MiniblockInfo) -> MiniblockWithSnapshot {
        MiniblockWithSnapshot { miniblock: info.miniblock.clone(), snapshot: info.snapshot_envelope.clone() }
    }

    pub fn into_info(self, opts: &MiniblockInfoOpts) -> Result<MiniblockInfo, StreamError> {
        MiniblockInfo::new(self.miniblock, self.snapshot, opts)
    }
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetMiniblocksResponse {
    pub miniblocks: Vec<MiniblockWithSnapshot>,
    /// Set if the response starts at the stream's first miniblock.
    pub terminus: bool,
}

/// Answers peer requests from a node's [`StreamCache`].
#[derive(Clone)]
pub struct StreamServiceHandler {
    cache: Arc<StreamCache>,
}

impl StreamServiceHandler {
    pub(crate) fn new(cache: Arc<StreamCache>) -> StreamServiceHandler {
        StreamServiceHandler { cache }
    }

    pub fn get_mb_proposal(&self, ctx: &Context, request: ProposeMiniblockRequest) -> Result<ProposeMiniblockResponse, StreamError> {
        let stream = self.cache.get_stream_no_wait(ctx, &request.stream_id)?;
        let view = stream.get_view(ctx)?;
        view.propose_for_remote(self.cache.stream_config(), &request)
    }

    pub fn save_mb_candidate(
        &self,
        ctx: &Context,
        stream_id: &StreamId,
        candidate: MiniblockWithSnapshot,
    ) -> Result<(), StreamError> {
        let stream = self.cache.get_stream_no_wait(ctx, stream_id)?;
        let candidate = candidate.into_info(&MiniblockInfoOpts::new())?;
        stream.save_miniblock_candidate(ctx, Arc::new(candidate))
    }

    pub fn get_mbs(
        &self,
        ctx: &Context,
        stream_id: &StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<GetMiniblocksResponse, StreamError> {
        let stream = self.cache.get_stream_no_wait(ctx, stream_id)?;
        let (miniblocks, terminus) = stream.get_miniblocks(ctx, from_inclusive, to_exclusive)?;
        Ok(GetMiniblocksResponse {
            miniblocks: miniblocks.iter().map(|mb| MiniblockWithSnapshot::from_info(mb)).collect(),
            terminus,
        })
    }

    pub fn get_mbs_by_ids(
        &self,
        ctx: &Context,
        stream_id: &StreamId,
        nums: &[i64],
    ) -> Result<Vec<MiniblockWithSnapshot>, StreamError> {
        let stream = self.cache.get_stream_no_wait(ctx, stream_id)?;
        let miniblocks = stream.get_miniblocks_by_ids(ctx, nums)?;
        Ok(miniblocks.iter().map(|mb| MiniblockWithSnapshot::from_info(mb)).collect())
    }

    pub fn get_last_miniblock_hash(&self, ctx: &Context, stream_id: &StreamId) -> Result<MiniblockRef, StreamError> {
        let stream = self.cache.get_stream_no_wait(ctx, stream_id)?;
        Ok(stream.get_view(ctx)?.last_block_ref())
    }

    pub fn get_stream(&self, ctx: &Context, stream_id: &StreamId, num_preceding: i64) -> Result<StreamAndCookie, StreamError> {
        let stream = self.cache.get_stream_no_wait(ctx, stream_id)?;
        let view = stream.get_view(ctx)?;
        Ok(view.get_stream_with_preceding(self.cache.local_address(), num_preceding.max(0) as usize))
    }
}
