use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use streamlog_rs::{
    config::{NodeConfiguration, StreamConfig},
    context::Context,
    errors::StreamError,
    events::{ApplyMiniblockEvent, EndReconcileEvent, ProduceCandidateEvent, ReconcileRetryQueuedEvent},
    node::{Node, NodeSpec},
    stream::StreamView,
    types::{
        data_types::{Address, MiniblockRef, StreamId},
        envelope::Envelope,
        miniblock::MiniblockInfo,
    },
};

use crate::common::{logging::log_with_context, mem_db::MemDB, network::NetworkStub, registry::RegistryStub};

/// Registry block time used by every test node.
pub(crate) const BLOCK_TIME: Duration = Duration::from_millis(100);

/// Knobs the tests turn. Everything else is shared by every node.
#[derive(Clone)]
pub(crate) struct TestNodeOptions {
    pub(crate) max_events_per_miniblock: usize,
    pub(crate) reconciliation_page_size: i64,
    pub(crate) backwards_reconciliation_threshold: i64,
    pub(crate) enable_backwards_reconciliation: bool,
    pub(crate) recency_constraints_age: Duration,
}

impl Default for TestNodeOptions {
    fn default() -> Self {
        TestNodeOptions {
            max_events_per_miniblock: 15_000,
            reconciliation_page_size: 128,
            backwards_reconciliation_threshold: 50,
            enable_backwards_reconciliation: true,
            recency_constraints_age: Duration::from_secs(11),
        }
    }
}

/// Outcome of one reconciliation, as reported by the node's events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReconcileReport {
    pub(crate) forward_miniblocks: usize,
    pub(crate) backfill_miniblocks: usize,
    pub(crate) reinitialized: bool,
}

/// A running node with in-memory storage, plus what the tests observe about it.
pub(crate) struct TestNode {
    address: Address,
    reconciliations: Arc<Mutex<Vec<ReconcileReport>>>,
    candidates: Arc<Mutex<usize>>,
    retries: Arc<Mutex<usize>>,
    node: Node,
}

impl TestNode {
    pub(crate) fn start(
        keypair: SigningKey,
        registry: Arc<RegistryStub>,
        network: NetworkStub,
        options: TestNodeOptions,
    ) -> TestNode {
        let address = Address::from(keypair.verifying_key());
        let reconciliations = Arc::new(Mutex::new(Vec::new()));
        let candidates = Arc::new(Mutex::new(0));
        let retries = Arc::new(Mutex::new(0));

        let stream_config = StreamConfig::builder()
            .max_events_per_miniblock(options.max_events_per_miniblock)
            .reconciliation_page_size(options.reconciliation_page_size)
            .backwards_reconciliation_threshold(options.backwards_reconciliation_threshold)
            .recency_constraints_age(options.recency_constraints_age)
            .build();
        let configuration = NodeConfiguration::builder()
            .me(keypair)
            .stream(stream_config)
            .block_time(BLOCK_TIME)
            .retry_reconciliation_interval(Duration::from_millis(200))
            .initial_sync_workers(2)
            .online_reconcile_workers(2)
            .enable_backwards_reconciliation(options.enable_backwards_reconciliation)
            .log_events(false)
            .build();

        let node = NodeSpec::builder()
            .kv_store(MemDB::new())
            .registry(registry)
            .remotes(Arc::new(network.clone()))
            .configuration(configuration)
            .on_apply_miniblock(apply_miniblock_handler(address))
            .on_produce_candidate(produce_candidate_handler(address, candidates.clone()))
            .on_end_reconcile(end_reconcile_handler(address, reconciliations.clone()))
            .on_reconcile_retry_queued(reconcile_retry_queued_handler(address, retries.clone()))
            .build()
            .start()
            .unwrap();
        network.register(address, node.service_handler());

        TestNode { address, reconciliations, candidates, retries, node }
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }

    /// The node's view of a stream, once the stream has local storage.
    pub(crate) fn view(&self, stream_id: &StreamId) -> Option<Arc<StreamView>> {
        let ctx = Context::background();
        let stream = self.node.stream_cache().get_stream_no_wait(&ctx, stream_id).ok()?;
        stream.get_view_if_local(&ctx).ok().flatten()
    }

    pub(crate) fn last_miniblock(&self, stream_id: &StreamId) -> Option<MiniblockRef> {
        self.view(stream_id).map(|view| view.last_block_ref())
    }

    /// Every miniblock of a stream, read through the node.
    pub(crate) fn miniblocks(&self, stream_id: &StreamId) -> Vec<Arc<MiniblockInfo>> {
        let ctx = Context::background();
        let last = match self.last_miniblock(stream_id) {
            Some(last) => last.num,
            None => return Vec::new(),
        };
        let stream = self.node.stream_cache().get_stream_no_wait(&ctx, stream_id).unwrap();
        let mut miniblocks = Vec::new();
        while (miniblocks.len() as i64) <= last {
            let (page, _) = stream.get_miniblocks(&ctx, miniblocks.len() as i64, last + 1).unwrap();
            assert!(!page.is_empty(), "miniblock {} of {} is missing", miniblocks.len(), stream_id);
            miniblocks.extend(page);
        }
        miniblocks
    }

    pub(crate) fn add_event(&self, stream_id: &StreamId, envelope: Envelope) -> Result<(), StreamError> {
        self.node.add_event(&Context::background(), stream_id, envelope).map(|_| ())
    }

    pub(crate) fn make_miniblock(&self, stream_id: &StreamId, force_snapshot: bool) -> Result<Option<MiniblockRef>, StreamError> {
        self.node.make_miniblock(&Context::with_timeout(Duration::from_secs(10)), stream_id, force_snapshot)
    }

    pub(crate) fn reconciliations(&self) -> Vec<ReconcileReport> {
        self.reconciliations.lock().unwrap().clone()
    }

    pub(crate) fn candidates_produced(&self) -> usize {
        *self.candidates.lock().unwrap()
    }

    pub(crate) fn retries_queued(&self) -> usize {
        *self.retries.lock().unwrap()
    }
}

/// Poll `condition` until it holds. Panics after `timeout`.
pub(crate) fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("timed out after {:?} waiting until {}", timeout, what);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn apply_miniblock_handler(address: Address) -> impl Fn(&ApplyMiniblockEvent) + Send + 'static {
    move |event| {
        log_with_context(
            Some(address),
            &format!(
                "Applied miniblock, stream: {}, miniblock: {}, events: {}, snapshot: {}",
                event.stream_id, event.miniblock, event.events, event.has_snapshot
            ),
        );
    }
}

fn produce_candidate_handler(address: Address, candidates: Arc<Mutex<usize>>) -> impl Fn(&ProduceCandidateEvent) + Send + 'static {
    move |event| {
        *candidates.lock().unwrap() += 1;
        log_with_context(
            Some(address),
            &format!(
                "Produced candidate, stream: {}, candidate: {}, events: {}, proposals: {}",
                event.stream_id, event.candidate, event.events, event.proposals
            ),
        );
    }
}

fn end_reconcile_handler(
    address: Address,
    reconciliations: Arc<Mutex<Vec<ReconcileReport>>>,
) -> impl Fn(&EndReconcileEvent) + Send + 'static {
    move |event| {
        log_with_context(
            Some(address),
            &format!(
                "Reconciled, stream: {}, forward: {}, backfill: {}, reinitialized: {}",
                event.stream_id, event.forward_miniblocks, event.backfill_miniblocks, event.reinitialized
            ),
        );
        reconciliations.lock().unwrap().push(ReconcileReport {
            forward_miniblocks: event.forward_miniblocks,
            backfill_miniblocks: event.backfill_miniblocks,
            reinitialized: event.reinitialized,
        });
    }
}

fn reconcile_retry_queued_handler(
    address: Address,
    retries: Arc<Mutex<usize>>,
) -> impl Fn(&ReconcileRetryQueuedEvent) + Send + 'static {
    move |event| {
        *retries.lock().unwrap() += 1;
        log_with_context(
            Some(address),
            &format!("Queued reconciliation retry, stream: {}, target: {}, error: {}", event.stream_id, event.expected_last, event.error),
        );
    }
}
