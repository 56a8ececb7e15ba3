/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A replicated, append-only event log organized in streams.
//!
//! Clients add signed events to a stream. The nodes holding the stream periodically seal the pending
//! events into a miniblock, agreeing on its content by majority, and register it with an external
//! [registry](registry::Registry) that orders commitments. Every so often a miniblock carries a
//! [snapshot](types::snapshot::Snapshot) of the stream's state folded from all events so far, so that a
//! stream can be loaded without replaying its whole history. Nodes that fall behind catch up from their
//! peers through [reconciliation](reconciliation).
//!
//! To run a node, build a [`NodeSpec`](node::NodeSpec) and [start](node::NodeSpec::start) it.

pub mod types;

pub mod snapshot;

pub mod stream;

pub mod storage;

pub mod config;

pub mod errors;

pub mod context;

pub mod events;

pub mod logging;

pub(crate) mod event_bus;

pub mod networking;

pub mod registry;

pub mod quorum_pool;

pub mod production;

pub mod reconciliation;

pub mod stream_cache;

pub(crate) mod worker_pool;

pub mod node;

#[cfg(test)]
pub(crate) mod testing;
