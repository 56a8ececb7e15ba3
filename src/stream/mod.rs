/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory state of a single stream.
//!
//! A [`view::StreamView`] is an immutable window over the stream: the miniblocks from the last snapshot on,
//! plus the [`minipool::Minipool`] of events not yet sealed. A [`stream::Stream`] holds the current view
//! and moves it forward as events are added and miniblocks are applied.

pub mod minipool;

pub mod view;

#[allow(clippy::module_inception)]
pub mod stream;

pub use stream::{Stream, SyncResultReceiver};
pub use view::{MbProposal, StreamAndCookie, StreamView, StreamViewStats, SyncCookie};
