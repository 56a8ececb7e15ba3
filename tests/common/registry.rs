use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use streamlog_rs::{
    context::Context,
    errors::StreamError,
    networking::MiniblockWithSnapshot,
    registry::{
        Registry, RegistryBlock, SetMiniblock, SetMiniblockBatchResult, StreamUpdatedEvent, StreamWithGenesis,
    },
    types::{
        data_types::{Address, BlockNumber, StreamId},
        miniblock::MiniblockInfo,
        stream_record::StreamRecord,
    },
};

/// An in-memory registry. Mutations are queued and published in the next block. A block, possibly empty,
/// is minted whenever a node polls and `block_period` has passed since the previous one, so registry
/// blocks keep driving miniblock production.
pub(crate) struct RegistryStub {
    block_period: Duration,
    state: Mutex<RegistryState>,
}

struct RegistryState {
    streams: HashMap<StreamId, StreamWithGenesis>,
    blocks: Vec<RegistryBlock>,
    pending: Vec<StreamUpdatedEvent>,
    last_minted: Instant,
    next_block: u64,
}

impl RegistryStub {
    pub(crate) fn new(block_period: Duration) -> RegistryStub {
        RegistryStub {
            block_period,
            state: Mutex::new(RegistryState {
                streams: HashMap::new(),
                blocks: Vec::new(),
                pending: Vec::new(),
                last_minted: Instant::now(),
                next_block: 1,
            }),
        }
    }

    /// A registry that mints blocks only when told to with [`RegistryStub::mint_block`].
    pub(crate) fn manual() -> RegistryStub {
        RegistryStub::new(Duration::MAX)
    }

    /// Publish every queued mutation in a new block right away.
    pub(crate) fn mint_block(&self) {
        self.state.lock().unwrap().mint_if_due(Duration::ZERO);
    }

    /// Place a new stream on `nodes`. The first `replication_factor` nodes form its quorum.
    pub(crate) fn allocate_stream(&self, genesis: &MiniblockInfo, nodes: Vec<Address>, replication_factor: usize) -> StreamRecord {
        let stream_id = genesis_stream_id(genesis);
        let record = StreamRecord {
            stream_id: stream_id.clone(),
            last_miniblock_hash: genesis.hash(),
            last_miniblock_num: 0,
            is_sealed: false,
            nodes,
            replication_factor,
        };
        let genesis_miniblock = MiniblockWithSnapshot::from_info(genesis);

        let mut state = self.state.lock().unwrap();
        state.streams.insert(
            stream_id,
            StreamWithGenesis {
                record: record.clone(),
                genesis_miniblock_hash: genesis.hash(),
                genesis_miniblock: genesis_miniblock.clone(),
            },
        );
        state.pending.push(StreamUpdatedEvent::Allocated { record: record.clone(), genesis_miniblock });
        record
    }

    pub(crate) fn record(&self, stream_id: &StreamId) -> Option<StreamRecord> {
        self.state.lock().unwrap().streams.get(stream_id).map(|stream| stream.record.clone())
    }
}

fn genesis_stream_id(genesis: &MiniblockInfo) -> StreamId {
    genesis
        .events()
        .first()
        .and_then(|inception| inception.payload().inception())
        .map(|(stream_id, _)| stream_id.clone())
        .expect("genesis miniblock must start with an inception event")
}

impl RegistryState {
    fn mint_if_due(&mut self, block_period: Duration) {
        if self.last_minted.elapsed() < block_period {
            return;
        }
        let block = RegistryBlock { number: BlockNumber::new(self.next_block), events: std::mem::take(&mut self.pending) };
        self.blocks.push(block);
        self.next_block += 1;
        self.last_minted = Instant::now();
    }
}

impl Registry for RegistryStub {
    fn get_stream(&self, _ctx: &Context, stream_id: &StreamId) -> Result<StreamRecord, StreamError> {
        self.record(stream_id).ok_or_else(|| StreamError::NotFound { what: format!("stream {}", stream_id) })
    }

    fn get_stream_with_genesis(&self, _ctx: &Context, stream_id: &StreamId) -> Result<StreamWithGenesis, StreamError> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::NotFound { what: format!("stream {}", stream_id) })
    }

    fn get_streams_on_node(&self, _ctx: &Context, node: &Address) -> Result<Vec<StreamRecord>, StreamError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .streams
            .values()
            .filter(|stream| stream.record.contains(node))
            .map(|stream| stream.record.clone())
            .collect())
    }

    fn set_stream_last_miniblock_batch(
        &self,
        _ctx: &Context,
        miniblocks: &[SetMiniblock],
    ) -> Result<SetMiniblockBatchResult, StreamError> {
        let mut state = self.state.lock().unwrap();
        let mut result = SetMiniblockBatchResult::default();
        for miniblock in miniblocks {
            let record = match state.streams.get_mut(&miniblock.stream_id) {
                Some(stream) => &mut stream.record,
                None => {
                    result.failed.push(miniblock.stream_id.clone());
                    continue;
                }
            };
            if record.last_miniblock_hash != miniblock.prev_miniblock_hash
                || record.last_miniblock_num + 1 != miniblock.last_miniblock.num
            {
                result.invalid.push(miniblock.stream_id.clone());
                continue;
            }
            record.last_miniblock_hash = miniblock.last_miniblock.hash;
            record.last_miniblock_num = miniblock.last_miniblock.num;
            record.is_sealed = miniblock.is_sealed;
            let record = record.clone();
            state.pending.push(StreamUpdatedEvent::LastMiniblockBatchUpdated { record });
            result.success.push(miniblock.stream_id.clone());
        }
        Ok(result)
    }

    fn blocks_since(&self, _ctx: &Context, after: Option<BlockNumber>) -> Result<Vec<RegistryBlock>, StreamError> {
        let mut state = self.state.lock().unwrap();
        state.mint_if_due(self.block_period);
        Ok(state
            .blocks
            .iter()
            .filter(|block| after.map_or(true, |after| block.number > after))
            .cloned()
            .collect())
    }
}
