/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Catching streams up with the registry by fetching missing miniblocks from peers.

pub mod ranges;

pub(crate) mod remote_tracker;

pub mod reconciler;

pub(crate) mod tasks;

pub use reconciler::ReconcilerStats;
