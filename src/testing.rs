/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fixtures shared by the unit tests of this crate: a volatile key-value store, a registry that only knows
//! what a test tells it, builders for channel streams, and a stream cache with no reachable peers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::StreamConfig;
use crate::context::Context;
use crate::errors::StreamError;
use crate::networking::{
    GetMiniblocksResponse, MiniblockWithSnapshot, ProposeMiniblockRequest, ProposeMiniblockResponse, RemoteMiniblockProvider,
};
use crate::registry::{Registry, RegistryBlock, SetMiniblock, SetMiniblockBatchResult, StreamWithGenesis};
use crate::snapshot::make_genesis_miniblock;
use crate::storage::kv_storage::KVStreamStorage;
use crate::storage::pluggables::{KVGet, KVStore};
use crate::storage::write_batch::WriteBatch;
use crate::stream::stream::StreamParams;
use crate::stream::StreamAndCookie;
use crate::stream_cache::{CacheSettings, StreamCache};
use crate::types::crypto_primitives::Wallet;
use crate::types::data_types::{Address, BlockNumber, MiniblockRef, StreamId, StreamType};
use crate::types::envelope::{make_parsed_event, ParsedEvent};
use crate::types::miniblock::MiniblockInfo;
use crate::types::payloads::{ChannelInception, ChannelPayload, EncryptedData, Payload, StreamSettings};
use crate::types::stream_record::StreamRecord;

/// Volatile key-value store. Writes replace values key by key.
#[derive(Clone, Default)]
pub(crate) struct MemDB(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl KVStore for MemDB {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.0 {
            match value {
                Some(value) => map.insert(key, value),
                None => map.remove(&key),
            };
        }
    }
}

impl KVGet for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

pub(crate) struct MemWriteBatch(HashMap<Vec<u8>, Option<Vec<u8>>>);

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch(HashMap::new())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.insert(key.to_vec(), Some(value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.insert(key.to_vec(), None);
    }
}

pub(crate) fn mem_storage() -> Arc<KVStreamStorage<MemDB>> {
    Arc::new(KVStreamStorage::new(MemDB::default()))
}

/// A registry holding streams a test put there. Commits always fail, and there are no blocks.
#[derive(Default)]
pub(crate) struct StaticRegistry {
    streams: Mutex<HashMap<StreamId, StreamWithGenesis>>,
}

impl StaticRegistry {
    pub(crate) fn add(&self, record: StreamRecord, genesis: &MiniblockInfo) {
        self.streams.lock().unwrap().insert(
            record.stream_id.clone(),
            StreamWithGenesis {
                record,
                genesis_miniblock_hash: genesis.hash(),
                genesis_miniblock: MiniblockWithSnapshot::from_info(genesis),
            },
        );
    }
}

impl Registry for StaticRegistry {
    fn get_stream(&self, ctx: &Context, stream_id: &StreamId) -> Result<StreamRecord, StreamError> {
        Ok(self.get_stream_with_genesis(ctx, stream_id)?.record)
    }

    fn get_stream_with_genesis(&self, _ctx: &Context, stream_id: &StreamId) -> Result<StreamWithGenesis, StreamError> {
        self.streams
            .lock()
            .unwrap()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::not_found(format!("stream {} in registry", stream_id)))
    }

    fn get_streams_on_node(&self, _ctx: &Context, node: &Address) -> Result<Vec<StreamRecord>, StreamError> {
        Ok(self.streams.lock().unwrap().values().map(|s| s.record.clone()).filter(|r| r.contains(node)).collect())
    }

    fn set_stream_last_miniblock_batch(
        &self,
        _ctx: &Context,
        miniblocks: &[SetMiniblock],
    ) -> Result<SetMiniblockBatchResult, StreamError> {
        Ok(SetMiniblockBatchResult { failed: miniblocks.iter().map(|mb| mb.stream_id.clone()).collect(), ..Default::default() })
    }

    fn blocks_since(&self, _ctx: &Context, _after: Option<BlockNumber>) -> Result<Vec<RegistryBlock>, StreamError> {
        Ok(Vec::new())
    }
}

/// The genesis miniblock of a new channel stream.
pub(crate) fn channel_genesis(wallet: &Wallet, settings: StreamSettings) -> MiniblockInfo {
    let stream_id = StreamId::random(StreamType::Channel);
    let inception = make_parsed_event(
        wallet,
        Payload::Channel(ChannelPayload::Inception(ChannelInception {
            stream_id,
            space_id: StreamId::random(StreamType::Space),
            settings,
        })),
        None,
    )
    .unwrap();
    make_genesis_miniblock(wallet, vec![inception], true).unwrap()
}

pub(crate) fn message_event(wallet: &Wallet, prev: &MiniblockInfo, text: &str) -> ParsedEvent {
    let payload = Payload::Channel(ChannelPayload::Message(EncryptedData { ciphertext: text.to_string(), ..Default::default() }));
    make_parsed_event(wallet, payload, Some(prev.miniblock_ref)).unwrap()
}

pub(crate) fn record_for(stream_id: &StreamId, nodes: Vec<Address>, last: &MiniblockInfo) -> StreamRecord {
    StreamRecord {
        stream_id: stream_id.clone(),
        last_miniblock_hash: last.hash(),
        last_miniblock_num: last.num(),
        is_sealed: false,
        replication_factor: nodes.len(),
        nodes,
    }
}

/// Peers that are all offline.
pub(crate) struct NoRemotes;

impl RemoteMiniblockProvider for NoRemotes {
    fn get_mb_proposal(&self, _: &Context, node: &Address, _: ProposeMiniblockRequest) -> Result<ProposeMiniblockResponse, StreamError> {
        Err(StreamError::DownstreamNetworkError { node: *node, reason: "offline".to_string() })
    }

    fn save_mb_candidate(&self, _: &Context, node: &Address, _: &StreamId, _: MiniblockWithSnapshot) -> Result<(), StreamError> {
        Err(StreamError::DownstreamNetworkError { node: *node, reason: "offline".to_string() })
    }

    fn get_mbs(&self, _: &Context, node: &Address, _: &StreamId, _: i64, _: i64) -> Result<GetMiniblocksResponse, StreamError> {
        Err(StreamError::DownstreamNetworkError { node: *node, reason: "offline".to_string() })
    }

    fn get_mbs_by_ids(&self, _: &Context, node: &Address, _: &StreamId, _: Vec<i64>) -> Result<Vec<MiniblockWithSnapshot>, StreamError> {
        Err(StreamError::DownstreamNetworkError { node: *node, reason: "offline".to_string() })
    }

    fn get_last_miniblock_hash(&self, _: &Context, node: &Address, _: &StreamId) -> Result<MiniblockRef, StreamError> {
        Err(StreamError::DownstreamNetworkError { node: *node, reason: "offline".to_string() })
    }

    fn get_stream(&self, _: &Context, node: &Address, _: &StreamId, _: i64) -> Result<StreamAndCookie, StreamError> {
        Err(StreamError::DownstreamNetworkError { node: *node, reason: "offline".to_string() })
    }
}

/// A stream cache over in-memory storage, with one online reconcile worker and no reachable peers.
pub(crate) fn mem_cache(wallet: Arc<Wallet>, registry: Arc<dyn Registry>) -> Arc<StreamCache> {
    let params = Arc::new(StreamParams {
        storage: mem_storage(),
        wallet,
        registry,
        config: StreamConfig::default(),
        event_publisher: None,
    });
    StreamCache::new(
        params,
        Arc::new(NoRemotes),
        CacheSettings {
            block_time: Duration::from_millis(100),
            retry_reconciliation_interval: Duration::from_secs(60),
            initial_sync_workers: 0,
            online_reconcile_workers: 1,
            enable_backwards_reconciliation: true,
        },
    )
}
