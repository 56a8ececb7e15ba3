/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where each stream variable is stored in the user-provided key-value store.
//!
//! Every variable is a **Borsh-serialized value** stored under a key formed by concatenating a one-byte
//! prefix from this module, the length-prefixed stream id, and, for per-miniblock variables, the
//! big-endian miniblock number (and the candidate hash).
//!
//! |Variable|Key|Value|
//! |---|---|---|
//! |Stream meta|`STREAM_META` ++ stream id|`StreamMeta`|
//! |Miniblocks|`MINIBLOCKS` ++ stream id ++ num|`MiniblockDescriptor`|
//! |Minipool|`MINIPOOL` ++ stream id|`StoredMinipool`|
//! |Candidates|`CANDIDATES` ++ stream id ++ num ++ hash|`MiniblockDescriptor`|
//! |Candidate hashes|`CANDIDATE_HASHES` ++ stream id ++ num|`Vec<CryptoHash>`|

use crate::types::data_types::{CryptoHash, StreamId};

pub const STREAM_META: [u8; 1] = [0];
pub const MINIBLOCKS: [u8; 1] = [1];
pub const MINIPOOL: [u8; 1] = [2];
pub const CANDIDATES: [u8; 1] = [3];
pub const CANDIDATE_HASHES: [u8; 1] = [4];

/// Takes references to two byteslices and returns a vector containing the bytes of the first one, and then
/// the bytes of the second one.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

pub(crate) fn stream_key(prefix: &[u8], stream_id: &StreamId) -> Vec<u8> {
    let mut key = concat(prefix, &[stream_id.bytes().len() as u8]);
    key.extend_from_slice(stream_id.bytes());
    key
}

pub(crate) fn miniblock_key(prefix: &[u8], stream_id: &StreamId, num: i64) -> Vec<u8> {
    concat(&stream_key(prefix, stream_id), &num.to_be_bytes())
}

pub(crate) fn candidate_key(stream_id: &StreamId, num: i64, hash: &CryptoHash) -> Vec<u8> {
    concat(&miniblock_key(&CANDIDATES, stream_id, num), &hash.bytes())
}
