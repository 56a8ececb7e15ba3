/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a stream node.
//!
//! A node keeps a set of streams on behalf of the registry: it accepts events for the streams placed on it,
//! seals them into miniblocks together with the other nodes of each stream's quorum, and catches streams up
//! from its peers when it falls behind.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct the [start-up parameters of a node](NodeSpec) with:
//!   1. `NodeSpec::builder` to construct a `NodeSpecBuilder`,
//!   2. The setters of the `NodeSpecBuilder`, and
//!   3. The `NodeSpecBuilder::build` method to construct a [NodeSpec],
//! - The function to [start](NodeSpec::start) a [Node] from its [NodeSpec],
//! - [The type](Node) which keeps the node alive.
//!
//! ## Starting a node
//!
//! ```ignore
//! let node =
//!     NodeSpec::builder()
//!     .kv_store(kv_store)
//!     .registry(registry)
//!     .remotes(remotes)
//!     .configuration(configuration)
//!     .on_apply_miniblock(apply_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! - `.kv_store(...)`
//! - `.registry(...)`
//! - `.remotes(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! One handler per event type in [crate::events]:
//! - `.on_add_event(...)`
//! - `.on_apply_miniblock(...)`
//! - `.on_promote_candidate(...)`
//! - `.on_save_candidate(...)`
//! - `.on_produce_candidate(...)`
//! - `.on_skip_candidate(...)`
//! - `.on_quorum_failed(...)`
//! - `.on_start_reconcile(...)`
//! - `.on_end_reconcile(...)`
//! - `.on_reconcile_retry_queued(...)`
//! - `.on_load_stream(...)`
//! - `.on_unload_stream(...)`
//!
//! ## Threads
//!
//! Besides the worker pools of the [`StreamCache`], a running node owns four threads:
//! 1. The block poller, which feeds every new registry block to the cache and then to the
//!    [`MiniblockProducer`].
//! 2. The reconcile retry loop.
//! 3. The cache cleanup loop, which unloads idle views.
//! 4. The event bus, if any handler is registered or `log_events` is set.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::config::NodeConfiguration;
use crate::context::Context;
use crate::errors::StreamError;
use crate::event_bus::*;
use crate::events::*;
use crate::networking::{RemoteMiniblockProvider, StreamServiceHandler};
use crate::production::MiniblockProducer;
use crate::registry::Registry;
use crate::storage::kv_storage::KVStreamStorage;
use crate::storage::pluggables::KVStore;
use crate::stream::stream::StreamParams;
use crate::stream::StreamView;
use crate::stream_cache::{CacheSettings, StreamCache};
use crate::types::crypto_primitives::Wallet;
use crate::types::data_types::{Address, BlockNumber, MiniblockRef, StreamId};
use crate::types::envelope::{Envelope, ParsedEvent};

const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Stores all the trait implementations and parameters required to run a [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.kv_store(...)`
    - `.registry(...)`
    - `.remotes(...)`
    - `.configuration(...)`

    Optional:
    - `.on_add_event(...)`
    - `.on_apply_miniblock(...)`
    - `.on_promote_candidate(...)`
    - `.on_save_candidate(...)`
    - `.on_produce_candidate(...)`
    - `.on_skip_candidate(...)`
    - `.on_quorum_failed(...)`
    - `.on_start_reconcile(...)`
    - `.on_end_reconcile(...)`
    - `.on_reconcile_retry_queued(...)`
    - `.on_load_stream(...)`
    - `.on_unload_stream(...)`
"
))]
pub struct NodeSpec<K: KVStore> {
    // Required parameters
    #[builder(setter(doc = "Set the key-value store streams are persisted in. The argument must implement the [KVStore](crate::storage::pluggables::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the client of the stream registry. Required."))]
    registry: Arc<dyn Registry>,
    #[builder(setter(doc = "Set the transport used to reach other nodes. Required."))]
    remotes: Arc<dyn RemoteMiniblockProvider>,
    #[builder(setter(doc = "Set the [configuration](NodeConfiguration) of the node. Required."))]
    configuration: NodeConfiguration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&AddEventEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AddEventEvent>),
    doc = "Register a handler closure to be invoked after an event is added to a minipool. Optional."))]
    on_add_event: Option<HandlerPtr<AddEventEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ApplyMiniblockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ApplyMiniblockEvent>),
    doc = "Register a handler closure to be invoked after a miniblock is applied to a stream. Optional."))]
    on_apply_miniblock: Option<HandlerPtr<ApplyMiniblockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PromoteCandidateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PromoteCandidateEvent>),
    doc = "Register a handler closure to be invoked after a confirmed candidate is promoted. Optional."))]
    on_promote_candidate: Option<HandlerPtr<PromoteCandidateEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SaveCandidateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SaveCandidateEvent>),
    doc = "Register a handler closure to be invoked after a candidate is stored. Optional."))]
    on_save_candidate: Option<HandlerPtr<SaveCandidateEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProduceCandidateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProduceCandidateEvent>),
    doc = "Register a handler closure to be invoked after this node produces a candidate. Optional."))]
    on_produce_candidate: Option<HandlerPtr<ProduceCandidateEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SkipCandidateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SkipCandidateEvent>),
    doc = "Register a handler closure to be invoked when candidate production is throttled. Optional."))]
    on_skip_candidate: Option<HandlerPtr<SkipCandidateEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&QuorumFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<QuorumFailedEvent>),
    doc = "Register a handler closure to be invoked when a quorum operation fails. Optional."))]
    on_quorum_failed: Option<HandlerPtr<QuorumFailedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartReconcileEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartReconcileEvent>),
    doc = "Register a handler closure to be invoked when a stream starts reconciling. Optional."))]
    on_start_reconcile: Option<HandlerPtr<StartReconcileEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndReconcileEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndReconcileEvent>),
    doc = "Register a handler closure to be invoked when a stream finishes reconciling. Optional."))]
    on_end_reconcile: Option<HandlerPtr<EndReconcileEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReconcileRetryQueuedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReconcileRetryQueuedEvent>),
    doc = "Register a handler closure to be invoked when a failed reconciliation is queued for retry. Optional."))]
    on_reconcile_retry_queued: Option<HandlerPtr<ReconcileRetryQueuedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&LoadStreamEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<LoadStreamEvent>),
    doc = "Register a handler closure to be invoked when a stream's view is loaded. Optional."))]
    on_load_stream: Option<HandlerPtr<LoadStreamEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UnloadStreamEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UnloadStreamEvent>),
    doc = "Register a handler closure to be invoked when an idle stream's view is unloaded. Optional."))]
    on_unload_stream: Option<HandlerPtr<UnloadStreamEvent>>,
}

impl<K: KVStore> NodeSpec<K> {
    /// Load the streams placed on this node, start every background thread, and return the handles to them
    /// in a [Node].
    pub fn start(self) -> Result<Node, StreamError> {
        let configuration = self.configuration;
        let wallet = Arc::new(Wallet::new(configuration.me));

        let event_handlers = EventHandlers::new(
            configuration.log_events,
            UserHandlers {
                add_event: self.on_add_event,
                apply_miniblock: self.on_apply_miniblock,
                promote_candidate: self.on_promote_candidate,
                save_candidate: self.on_save_candidate,
                produce_candidate: self.on_produce_candidate,
                skip_candidate: self.on_skip_candidate,
                quorum_failed: self.on_quorum_failed,
                start_reconcile: self.on_start_reconcile,
                end_reconcile: self.on_end_reconcile,
                reconcile_retry_queued: self.on_reconcile_retry_queued,
                load_stream: self.on_load_stream,
                unload_stream: self.on_unload_stream,
            },
        );

        let (event_publisher, event_subscriber) =
            if !event_handlers.is_empty() { Some(mpsc::channel()).unzip() } else { (None, None) };

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                (Some(start_event_bus(event_handlers, event_subscriber, shutdown_receiver)), Some(shutdown))
            }
            None => (None, None),
        };

        let params = Arc::new(StreamParams {
            storage: Arc::new(KVStreamStorage::new(self.kv_store)),
            wallet,
            registry: self.registry.clone(),
            config: configuration.stream,
            event_publisher,
        });
        let cache = StreamCache::new(
            params,
            self.remotes,
            CacheSettings {
                block_time: configuration.block_time,
                retry_reconciliation_interval: configuration.retry_reconciliation_interval,
                initial_sync_workers: configuration.initial_sync_workers,
                online_reconcile_workers: configuration.online_reconcile_workers,
                enable_backwards_reconciliation: configuration.enable_backwards_reconciliation,
            },
        );
        if let Err(err) = cache.start(&cache.server_ctx.child()) {
            cache.stop();
            return Err(err);
        }
        let producer = MiniblockProducer::new(cache.clone(), configuration.miniblock_workers);

        let (block_poller_shutdown, block_poller_shutdown_receiver) = mpsc::channel();
        let block_poller = start_block_poller(
            cache.clone(),
            producer.clone(),
            self.registry,
            (configuration.block_time / 2).max(Duration::from_millis(10)),
            block_poller_shutdown_receiver,
        );

        let (retry_loop_shutdown, retry_loop_shutdown_receiver) = mpsc::channel();
        let retry_cache = cache.clone();
        let retry_loop = start_periodic("reconcile_retry", RETRY_POLL_INTERVAL, retry_loop_shutdown_receiver, move || {
            let resubmitted = retry_cache.process_reconcile_retries();
            if resubmitted > 0 {
                log::info!("resubmitted {} reconciliations", resubmitted);
            }
        });

        let (cleanup_loop_shutdown, cleanup_loop_shutdown_receiver) = mpsc::channel();
        let cleanup_cache = cache.clone();
        let cache_expiration = configuration.cache_expiration;
        let cache_cleanup_enabled = configuration.cache_cleanup_enabled;
        let cleanup_interval = (cache_expiration / 2).clamp(Duration::from_millis(10), MAX_CLEANUP_INTERVAL);
        let cleanup_loop = start_periodic("cache_cleanup", cleanup_interval, cleanup_loop_shutdown_receiver, move || {
            let result = cleanup_cache.cache_cleanup(cache_cleanup_enabled, cache_expiration);
            if result.unloaded > 0 {
                log::debug!("unloaded {} of {} streams ({} remote)", result.unloaded, result.total, result.remote);
            }
        });

        Ok(Node {
            cache,
            producer,
            block_poller: Some(block_poller),
            block_poller_shutdown,
            retry_loop: Some(retry_loop),
            retry_loop_shutdown,
            cleanup_loop: Some(cleanup_loop),
            cleanup_loop_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// Feed every new registry block to the cache, then to the producer.
fn start_block_poller(
    cache: Arc<StreamCache>,
    producer: Arc<MiniblockProducer>,
    registry: Arc<dyn Registry>,
    poll_interval: Duration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_block: Option<BlockNumber> = None;
        loop {
            let ctx = cache.server_ctx.child();
            match registry.blocks_since(&ctx, last_block) {
                Ok(blocks) => {
                    for block in blocks {
                        cache.on_block(&ctx, &block);
                        producer.on_new_block(block.number);
                        last_block = Some(block.number);
                    }
                }
                Err(err) if err.is_cancellation() => return,
                Err(err) => log::warn!("failed to read registry blocks after {:?}: {}", last_block, err),
            }

            match shutdown_signal.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => (),
            }
        }
    })
}

fn start_periodic(
    name: &'static str,
    interval: Duration,
    shutdown_signal: Receiver<()>,
    mut tick: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::debug!("{} loop stopped", name);
                return;
            }
            Err(RecvTimeoutError::Timeout) => tick(),
        }
    })
}

/// A handle to the background threads of a stream node. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Node {
    cache: Arc<StreamCache>,
    producer: Arc<MiniblockProducer>,
    block_poller: Option<JoinHandle<()>>,
    block_poller_shutdown: Sender<()>,
    retry_loop: Option<JoinHandle<()>>,
    retry_loop_shutdown: Sender<()>,
    cleanup_loop: Option<JoinHandle<()>>,
    cleanup_loop_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Node {
    pub fn address(&self) -> Address {
        self.cache.local_address()
    }

    pub fn stream_cache(&self) -> &Arc<StreamCache> {
        &self.cache
    }

    pub fn producer(&self) -> &Arc<MiniblockProducer> {
        &self.producer
    }

    /// A handler for requests from other nodes, to be wired into the transport.
    pub fn service_handler(&self) -> StreamServiceHandler {
        StreamServiceHandler::new(self.cache.clone())
    }

    /// Parse and add a client's event to a stream placed on this node.
    pub fn add_event(&self, ctx: &Context, stream_id: &StreamId, envelope: Envelope) -> Result<Arc<StreamView>, StreamError> {
        let event = ParsedEvent::parse(envelope)?;
        let stream = self.cache.get_stream_wait_for_local(ctx, stream_id)?;
        stream.add_client_event(ctx, event)
    }

    /// Seal the minipool of a stream into a miniblock now. See [`MiniblockProducer::make_miniblock`].
    pub fn make_miniblock(&self, ctx: &Context, stream_id: &StreamId, force_snapshot: bool) -> Result<Option<MiniblockRef>, StreamError> {
        self.producer.make_miniblock(ctx, stream_id, force_snapshot)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // The poller goes first so no new jobs or reconciliations are started while the rest shuts down.
        let _ = self.block_poller_shutdown.send(());
        if let Some(block_poller) = self.block_poller.take() {
            let _ = block_poller.join();
        }
        let _ = self.retry_loop_shutdown.send(());
        if let Some(retry_loop) = self.retry_loop.take() {
            let _ = retry_loop.join();
        }
        let _ = self.cleanup_loop_shutdown.send(());
        if let Some(cleanup_loop) = self.cleanup_loop.take() {
            let _ = cleanup_loop.join();
        }

        self.producer.stop();
        self.cache.stop();

        self.event_bus_shutdown.iter().for_each(|shutdown| {
            let _ = shutdown.send(());
        });
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
