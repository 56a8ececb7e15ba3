/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration of a stream node.
//!
//! [`StreamConfig`] holds the settings that all nodes of a network must agree on (recency constraints,
//! snapshot thresholds, miniblock limits). [`NodeConfiguration`] holds per-process settings (identity,
//! worker pools, timers) and embeds a `StreamConfig`. Both are built with the builder pattern:
//!
//! ```ignore
//! let config = NodeConfiguration::builder()
//!     .me(signing_key)
//!     .stream(StreamConfig::builder().max_events_per_miniblock(3).build())
//!     .log_events(true)
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::types::crypto_primitives::SigningKey;
use crate::types::data_types::StreamType;

/// Number of events after which a miniblock carries a new snapshot.
#[derive(Clone, Debug)]
pub struct MinSnapshotEventsSettings {
    pub default: usize,
    /// Overrides for the user-owned stream types.
    pub user: usize,
}

impl Default for MinSnapshotEventsSettings {
    fn default() -> Self {
        Self { default: 100, user: 10 }
    }
}

impl MinSnapshotEventsSettings {
    pub fn for_type(&self, stream_type: Option<StreamType>) -> usize {
        match stream_type {
            Some(stream_type) if stream_type.is_user_type() => self.user,
            _ => self.default,
        }
    }
}

/// Number of miniblocks of history a node keeps for each stream. Zero keeps everything.
#[derive(Clone, Debug, Default)]
pub struct StreamHistorySettings {
    pub default: i64,
    pub overrides: BTreeMap<StreamType, i64>,
}

impl StreamHistorySettings {
    pub fn for_type(&self, stream_type: Option<StreamType>) -> i64 {
        stream_type.and_then(|stream_type| self.overrides.get(&stream_type).copied()).unwrap_or(self.default)
    }
}

#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [StreamConfig]. Every setting has a default, so `StreamConfig::builder().build()`
    is a valid configuration.
"
))]
pub struct StreamConfig {
    #[builder(default = Duration::from_secs(11), setter(doc = "Set how old the miniblock referenced by a new event may be. Default: 11 s."))]
    pub recency_constraints_age: Duration,
    #[builder(default = 5, setter(doc = "Set how many generations behind the last miniblock a new event may reference. Default: 5."))]
    pub recency_constraints_gen: i64,
    #[builder(default, setter(doc = "Set the number of events after which a snapshot is taken, per stream type. Default: 100, user streams 10."))]
    pub min_snapshot_events: MinSnapshotEventsSettings,
    #[builder(default = 15_000, setter(doc = "Set the maximum number of events sealed into one miniblock. Default: 15000."))]
    pub max_events_per_miniblock: usize,
    #[builder(default = 0, setter(doc = "Set the maximum combined size in bytes of the events of one miniblock. Zero is unlimited. Default: 0."))]
    pub max_total_events_size_per_miniblock: usize,
    #[builder(default, setter(doc = "Set how many miniblocks of history to keep, per stream type. Zero keeps everything. Default: 0."))]
    pub stream_history_miniblocks: StreamHistorySettings,
    #[builder(default = 50, setter(doc = "Set the gap, in miniblocks, above which a stream is reinitialized from a peer instead of fetched forward. Default: 50."))]
    pub backwards_reconciliation_threshold: i64,
    #[builder(default = 128, setter(doc = "Set how many miniblocks are fetched per page during reconciliation. Default: 128."))]
    pub reconciliation_page_size: i64,
    #[builder(default = true, setter(doc = "Store snapshots next to miniblocks instead of embedding them in the header. Default: true."))]
    pub enable_new_snapshot_format: bool,
    #[builder(default = 10, setter(doc = "Set how many registry blocks a stream keeps the same leader for. Default: 10."))]
    pub miniblock_leader_block_interval: u64,
    #[builder(default = 50, setter(doc = "Set how many candidates are registered in one registry batch. Default: 50."))]
    pub miniblock_candidate_batch_size: usize,
    #[builder(default = 3, setter(doc = "Set how many confirmed but not yet applied candidates a stream may queue. Default: 3."))]
    pub max_pending_candidates: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig::builder().build()
    }
}

impl StreamConfig {
    /// Limits for one miniblock: event count and combined size. A size of zero means unlimited.
    pub fn miniblock_event_limits(&self) -> (usize, usize) {
        let max_size = if self.max_total_events_size_per_miniblock == 0 {
            usize::MAX
        } else {
            self.max_total_events_size_per_miniblock
        };
        (self.max_events_per_miniblock.max(1), max_size)
    }
}

#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [NodeConfiguration]. On the builder call the following methods to construct a valid [NodeConfiguration].

    Required:
    - `.me(...)`

    Everything else has a default.
"
))]
pub struct NodeConfiguration {
    #[builder(setter(doc = "Set the node's signing key, used to sign miniblock headers and snapshots. Required."))]
    pub me: SigningKey,
    #[builder(default, setter(doc = "Set the network-wide stream settings. Default: `StreamConfig::default()`."))]
    pub stream: StreamConfig,
    #[builder(default = Duration::from_secs(2), setter(doc = "Set the registry block time, used to batch candidate registrations. Default: 2 s."))]
    pub block_time: Duration,
    #[builder(default = Duration::from_secs(300), setter(doc = "Set how long a view may stay idle before it is unloaded. Default: 5 min."))]
    pub cache_expiration: Duration,
    #[builder(default = true, setter(doc = "Enable periodic unloading of idle views. Default: true."))]
    pub cache_cleanup_enabled: bool,
    #[builder(default = Duration::from_secs(120), setter(doc = "Set how long a failed reconciliation waits before it is retried. Default: 2 min."))]
    pub retry_reconciliation_interval: Duration,
    #[builder(default = 4, setter(doc = "Set the number of workers that sync streams at startup. Zero defers syncing to first access. Default: 4."))]
    pub initial_sync_workers: usize,
    #[builder(default = 4, setter(doc = "Set the number of workers that reconcile streams while the node runs. Default: 4."))]
    pub online_reconcile_workers: usize,
    #[builder(default = 8, setter(doc = "Set the number of workers that run miniblock jobs. Default: 8."))]
    pub miniblock_workers: usize,
    #[builder(default = true, setter(doc = "Allow reinitializing a stream from a peer when the gap is large. Default: true."))]
    pub enable_backwards_reconciliation: bool,
    #[builder(default = false, setter(doc = "Enable logging? Default: false."))]
    pub log_events: bool,
}
