/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the stream node.
//!
//! Types specific to a single component live next to that component, e.g. the proposal types in
//! [`crate::networking`].

pub mod data_types;

pub mod crypto_primitives;

pub mod payloads;

pub mod envelope;

pub mod miniblock;

pub mod snapshot;

pub mod stream_record;
