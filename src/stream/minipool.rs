/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events accepted into a stream but not yet sealed into a miniblock.

use std::collections::HashMap;
use std::sync::Arc;

use borsh::BorshSerialize;

use crate::errors::StreamError;
use crate::types::data_types::CryptoHash;
use crate::types::envelope::ParsedEvent;

/// Ordered, deduplicated set of pending events for generation `generation` of a stream.
///
/// `generation` is always the number of the next miniblock, and `event_num_offset` the event number that
/// the first pending event will receive once sealed.
#[derive(Clone, Debug)]
pub struct Minipool {
    generation: i64,
    event_num_offset: i64,
    events: Vec<Arc<ParsedEvent>>,
    index: HashMap<CryptoHash, usize>,
}

impl Minipool {
    pub fn new(generation: i64, event_num_offset: i64) -> Minipool {
        Minipool { generation, event_num_offset, events: Vec::new(), index: HashMap::new() }
    }

    /// Build a minipool from events in order. Fails with `DataLoss` if an event appears twice.
    pub fn from_events(
        generation: i64,
        event_num_offset: i64,
        events: Vec<Arc<ParsedEvent>>,
    ) -> Result<Minipool, StreamError> {
        let mut minipool = Minipool::new(generation, event_num_offset);
        for event in events {
            if minipool.index.contains_key(&event.hash) {
                return Err(StreamError::DataLoss {
                    reason: format!("duplicate event {} in minipool of generation {}", event.hash, generation),
                });
            }
            minipool.push(event);
        }
        Ok(minipool)
    }

    fn push(&mut self, event: Arc<ParsedEvent>) {
        self.index.insert(event.hash, self.events.len());
        self.events.push(event);
    }

    /// A copy with `event` appended, or `None` if the event is already pending.
    pub fn try_copy_and_add(&self, event: Arc<ParsedEvent>) -> Option<Minipool> {
        if self.index.contains_key(&event.hash) {
            return None;
        }
        let mut copy = self.clone();
        copy.push(event);
        Some(copy)
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn event_num_offset(&self) -> i64 {
        self.event_num_offset
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Storage slot of the next event added.
    pub fn next_slot_number(&self) -> usize {
        self.events.len()
    }

    pub fn contains(&self, hash: &CryptoHash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn get(&self, hash: &CryptoHash) -> Option<&Arc<ParsedEvent>> {
        self.index.get(hash).map(|i| &self.events[*i])
    }

    pub fn events(&self) -> &[Arc<ParsedEvent>] {
        &self.events
    }

    pub fn hashes(&self) -> Vec<CryptoHash> {
        self.events.iter().map(|event| event.hash).collect()
    }

    pub fn last_event(&self) -> Option<&Arc<ParsedEvent>> {
        self.events.last()
    }

    /// Serialized envelopes, in order, as written to storage.
    pub fn envelope_bytes(&self) -> Result<Vec<Vec<u8>>, StreamError> {
        self.events
            .iter()
            .map(|event| {
                event
                    .envelope
                    .try_to_vec()
                    .map_err(|err| StreamError::internal(format!("failed to serialize event {}: {}", event.hash, err)))
            })
            .collect()
    }

    /// Visit every pending event with its would-be event number. Stops early when `op` returns `false`.
    pub fn for_each_event<F>(&self, op: &mut F) -> Result<bool, StreamError>
    where
        F: FnMut(&ParsedEvent, i64, i64) -> Result<bool, StreamError>,
    {
        for (i, event) in self.events.iter().enumerate() {
            if !op(event, -1, self.event_num_offset + i as i64)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A minipool for the next generation holding the events of this one not in `sealed`, in their
    /// original order. Also returns the hashes in `sealed` that were not pending here.
    pub(crate) fn copy_without(
        &self,
        sealed: &[CryptoHash],
        next_generation: i64,
        next_event_num_offset: i64,
    ) -> (Minipool, Vec<CryptoHash>) {
        let mut covered = vec![false; self.events.len()];
        let mut new_hashes = Vec::new();
        for hash in sealed {
            match self.index.get(hash) {
                Some(i) => covered[*i] = true,
                None => new_hashes.push(*hash),
            }
        }
        let mut next = Minipool::new(next_generation, next_event_num_offset);
        for (event, covered) in self.events.iter().zip(covered) {
            if !covered {
                next.push(event.clone());
            }
        }
        (next, new_hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::Wallet;
    use crate::types::envelope::make_parsed_event;
    use crate::types::payloads::{ChannelPayload, EncryptedData, Payload};

    fn message(wallet: &Wallet, text: &str) -> Arc<ParsedEvent> {
        let payload = Payload::Channel(ChannelPayload::Message(EncryptedData {
            ciphertext: text.to_string(),
            ..Default::default()
        }));
        Arc::new(make_parsed_event(wallet, payload, None).unwrap())
    }

    #[test]
    fn add_is_idempotent_and_ordered() {
        let wallet = Wallet::generate();
        let (a, b) = (message(&wallet, "a"), message(&wallet, "b"));

        let pool = Minipool::new(3, 20);
        let pool = pool.try_copy_and_add(a.clone()).unwrap();
        let pool = pool.try_copy_and_add(b.clone()).unwrap();
        assert!(pool.try_copy_and_add(a.clone()).is_none());
        assert_eq!(pool.hashes(), vec![a.hash, b.hash]);
        assert_eq!(pool.next_slot_number(), 2);

        let mut numbers = Vec::new();
        pool.for_each_event(&mut |_, _, event_num| {
            numbers.push(event_num);
            Ok(true)
        })
        .unwrap();
        assert_eq!(numbers, vec![20, 21]);
    }

    #[test]
    fn from_events_rejects_duplicates() {
        let wallet = Wallet::generate();
        let a = message(&wallet, "a");
        let err = Minipool::from_events(1, 1, vec![a.clone(), a]).unwrap_err();
        assert_eq!(err.code(), crate::errors::ErrorCode::DataLoss);
    }

    #[test]
    fn copy_without_keeps_remaining_order() {
        let wallet = Wallet::generate();
        let (a, b, c, d) = (message(&wallet, "a"), message(&wallet, "b"), message(&wallet, "c"), message(&wallet, "d"));
        let pool = Minipool::from_events(1, 1, vec![a.clone(), b.clone(), c.clone()]).unwrap();

        let (next, new_hashes) = pool.copy_without(&[b.hash, d.hash], 2, 4);
        assert_eq!(next.hashes(), vec![a.hash, c.hash]);
        assert_eq!(new_hashes, vec![d.hash]);
        assert_eq!(next.generation(), 2);
        assert_eq!(next.event_num_offset(), 4);
    }
}
