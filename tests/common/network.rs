use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use streamlog_rs::{
    context::Context,
    errors::StreamError,
    networking::{
        GetMiniblocksResponse, MiniblockWithSnapshot, ProposeMiniblockRequest, ProposeMiniblockResponse,
        RemoteMiniblockProvider, StreamServiceHandler,
    },
    stream::StreamAndCookie,
    types::data_types::{Address, MiniblockRef, StreamId},
};

/// A mock transport which hands every request straight to the [`StreamServiceHandler`] of the addressed node
/// on the calling thread. Nodes can be taken offline to simulate network failures.
#[derive(Clone, Default)]
pub(crate) struct NetworkStub {
    handlers: Arc<RwLock<HashMap<Address, StreamServiceHandler>>>,
    offline: Arc<RwLock<HashSet<Address>>>,
}

impl NetworkStub {
    pub(crate) fn new() -> NetworkStub {
        NetworkStub::default()
    }

    pub(crate) fn register(&self, node: Address, handler: StreamServiceHandler) {
        self.handlers.write().unwrap().insert(node, handler);
    }

    pub(crate) fn set_online(&self, node: Address, online: bool) {
        let mut offline = self.offline.write().unwrap();
        if online {
            offline.remove(&node);
        } else {
            offline.insert(node);
        }
    }

    fn handler(&self, node: &Address) -> Result<StreamServiceHandler, StreamError> {
        if self.offline.read().unwrap().contains(node) {
            return Err(StreamError::DownstreamNetworkError { node: *node, reason: String::from("node is offline") });
        }
        self.handlers
            .read()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| StreamError::DownstreamNetworkError { node: *node, reason: String::from("unknown node") })
    }
}

impl RemoteMiniblockProvider for NetworkStub {
    fn get_mb_proposal(
        &self,
        ctx: &Context,
        node: &Address,
        request: ProposeMiniblockRequest,
    ) -> Result<ProposeMiniblockResponse, StreamError> {
        self.handler(node)?.get_mb_proposal(ctx, request)
    }

    fn save_mb_candidate(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        candidate: MiniblockWithSnapshot,
    ) -> Result<(), StreamError> {
        self.handler(node)?.save_mb_candidate(ctx, stream_id, candidate)
    }

    fn get_mbs(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<GetMiniblocksResponse, StreamError> {
        self.handler(node)?.get_mbs(ctx, stream_id, from_inclusive, to_exclusive)
    }

    fn get_mbs_by_ids(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        nums: Vec<i64>,
    ) -> Result<Vec<MiniblockWithSnapshot>, StreamError> {
        self.handler(node)?.get_mbs_by_ids(ctx, stream_id, &nums)
    }

    fn get_last_miniblock_hash(&self, ctx: &Context, node: &Address, stream_id: &StreamId) -> Result<MiniblockRef, StreamError> {
        self.handler(node)?.get_last_miniblock_hash(ctx, stream_id)
    }

    fn get_stream(
        &self,
        ctx: &Context,
        node: &Address,
        stream_id: &StreamId,
        num_preceding: i64,
    ) -> Result<StreamAndCookie, StreamError> {
        self.handler(node)?.get_stream(ctx, stream_id, num_preceding)
    }
}
