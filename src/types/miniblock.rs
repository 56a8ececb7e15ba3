/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Miniblocks: sealed, hash-chained batches of events.
//!
//! A [`Miniblock`] is a header envelope followed by the envelopes of the events it seals. The hash of the
//! header envelope is the hash of the miniblock. [`MiniblockInfo`] is the parsed and validated form that
//! the rest of the crate works with.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::StreamError;
use crate::snapshot::parse_snapshot;
use crate::storage::MiniblockDescriptor;

use super::crypto_primitives::Wallet;
use super::data_types::{CryptoHash, MiniblockRef};
use super::envelope::{make_parsed_event, Envelope, ParsedEvent};
use super::payloads::Payload;
use super::snapshot::Snapshot;

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MiniblockHeader {
    pub miniblock_num: i64,
    pub prev_miniblock_hash: CryptoHash,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub event_hashes: Vec<CryptoHash>,
    /// Legacy format: the snapshot is embedded in the header.
    pub snapshot: Option<Snapshot>,
    /// New format: the snapshot is stored next to the miniblock in its own envelope.
    pub snapshot_hash: Option<CryptoHash>,
    /// Event number of the first event in this miniblock.
    pub event_num_offset: i64,
    pub prev_snapshot_miniblock_num: i64,
}

impl MiniblockHeader {
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some() || self.snapshot_hash.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Miniblock {
    pub header: Envelope,
    pub events: Vec<Envelope>,
}

/// Expectations checked by [`MiniblockInfo::new`]. Unset fields are not checked.
#[derive(Clone, Debug, Default)]
pub struct MiniblockInfoOpts {
    pub expected_block_number: Option<i64>,
    pub expected_prev_miniblock_hash: Option<CryptoHash>,
    pub expected_event_num_offset: Option<i64>,
    pub expected_minimum_timestamp_exclusive: Option<i64>,
    pub expected_prev_snapshot_miniblock_num: Option<i64>,
}

impl MiniblockInfoOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected_block_number(mut self, num: i64) -> Self {
        self.expected_block_number = Some(num);
        self
    }

    pub fn with_expected_prev_miniblock_hash(mut self, hash: CryptoHash) -> Self {
        self.expected_prev_miniblock_hash = Some(hash);
        self
    }

    pub fn with_expected_event_num_offset(mut self, offset: i64) -> Self {
        self.expected_event_num_offset = Some(offset);
        self
    }

    pub fn with_expected_minimum_timestamp_exclusive(mut self, timestamp: i64) -> Self {
        self.expected_minimum_timestamp_exclusive = Some(timestamp);
        self
    }

    pub fn with_expected_prev_snapshot_miniblock_num(mut self, num: i64) -> Self {
        self.expected_prev_snapshot_miniblock_num = Some(num);
        self
    }
}

/// A parsed miniblock: its reference, header, parsed events, and the snapshot it carries, if any.
#[derive(Clone, Debug)]
pub struct MiniblockInfo {
    pub miniblock_ref: MiniblockRef,
    pub miniblock: Miniblock,
    pub snapshot_envelope: Option<Envelope>,
    header_event: ParsedEvent,
    header: MiniblockHeader,
    events: Vec<ParsedEvent>,
    snapshot: Option<Arc<Snapshot>>,
}

impl MiniblockInfo {
    /// Parse `miniblock`, and its detached snapshot if present, checking them against `opts`.
    pub fn new(
        miniblock: Miniblock,
        snapshot_envelope: Option<Envelope>,
        opts: &MiniblockInfoOpts,
    ) -> Result<MiniblockInfo, StreamError> {
        let header_event = ParsedEvent::parse(miniblock.header.clone())?;
        let header = match header_event.payload() {
            Payload::MiniblockHeader(header) => header.clone(),
            _ => return Err(StreamError::bad_event("header event must be a block header")),
        };

        if let Some(expected) = opts.expected_block_number {
            if header.miniblock_num != expected {
                return Err(StreamError::bad_block(format!(
                    "block number {} does not equal expected {}",
                    header.miniblock_num, expected
                )));
            }
        }

        if header.event_hashes.len() != miniblock.events.len() {
            return Err(StreamError::bad_block(format!(
                "header lists {} event hashes but block has {} events",
                header.event_hashes.len(),
                miniblock.events.len()
            )));
        }

        let events = ParsedEvent::parse_all(&miniblock.events)?;
        for (i, (event, expected)) in events.iter().zip(header.event_hashes.iter()).enumerate() {
            if event.hash != *expected {
                return Err(StreamError::bad_block(format!(
                    "event {} hash {} does not match header hash {}",
                    i, event.hash, expected
                )));
            }
        }

        if let Some(expected) = opts.expected_prev_miniblock_hash {
            if header.prev_miniblock_hash != expected {
                return Err(StreamError::bad_block(format!(
                    "prev miniblock hash {} does not equal expected {}",
                    header.prev_miniblock_hash, expected
                )));
            }
        }

        if let Some(expected) = opts.expected_event_num_offset {
            if header.event_num_offset != expected {
                return Err(StreamError::bad_block(format!(
                    "event num offset {} does not equal expected {}",
                    header.event_num_offset, expected
                )));
            }
        }

        if let Some(minimum) = opts.expected_minimum_timestamp_exclusive {
            if header.timestamp <= minimum {
                return Err(StreamError::bad_block(format!(
                    "header timestamp {} is not after {}",
                    header.timestamp, minimum
                )));
            }
        }

        if let Some(expected) = opts.expected_prev_snapshot_miniblock_num {
            if header.prev_snapshot_miniblock_num != expected {
                return Err(StreamError::bad_block(format!(
                    "prev snapshot miniblock num {} does not equal expected {}",
                    header.prev_snapshot_miniblock_num, expected
                )));
            }
        }

        let snapshot = match (&header.snapshot, &snapshot_envelope) {
            (Some(embedded), _) => Some(Arc::new(embedded.clone())),
            (None, Some(envelope)) => {
                if header.snapshot_hash != Some(envelope.hash) {
                    return Err(StreamError::bad_block(format!(
                        "snapshot envelope hash {} does not match header snapshot hash {:?}",
                        envelope.hash, header.snapshot_hash
                    )));
                }
                Some(Arc::new(parse_snapshot(envelope, header_event.creator())?))
            }
            _ => None,
        };

        Ok(MiniblockInfo {
            miniblock_ref: MiniblockRef::new(header_event.hash, header.miniblock_num),
            miniblock,
            snapshot_envelope,
            header_event,
            header,
            events,
            snapshot,
        })
    }

    /// Assemble a miniblock from an already parsed header event and events.
    pub fn from_parsed(
        header_event: ParsedEvent,
        events: Vec<ParsedEvent>,
        snapshot_envelope: Option<Envelope>,
        snapshot: Option<Snapshot>,
    ) -> Result<MiniblockInfo, StreamError> {
        let header = match header_event.payload() {
            Payload::MiniblockHeader(header) => header.clone(),
            _ => return Err(StreamError::bad_event("header event must be a block header")),
        };
        let snapshot = match (&header.snapshot, snapshot) {
            (Some(embedded), _) => Some(Arc::new(embedded.clone())),
            (None, detached) => detached.map(Arc::new),
        };
        Ok(MiniblockInfo {
            miniblock_ref: MiniblockRef::new(header_event.hash, header.miniblock_num),
            miniblock: Miniblock {
                header: header_event.envelope.clone(),
                events: events.iter().map(|event| event.envelope.clone()).collect(),
            },
            snapshot_envelope,
            header_event,
            header,
            events,
            snapshot,
        })
    }

    /// Sign `header` with `wallet` and assemble the miniblock.
    pub fn from_header_and_parsed(
        wallet: &Wallet,
        header: MiniblockHeader,
        events: Vec<ParsedEvent>,
        snapshot_envelope: Option<Envelope>,
        snapshot: Option<Snapshot>,
    ) -> Result<MiniblockInfo, StreamError> {
        let prev = MiniblockRef::new(header.prev_miniblock_hash, (header.miniblock_num - 1).max(0));
        let header_event = make_parsed_event(wallet, Payload::MiniblockHeader(header), Some(prev))?;
        Self::from_parsed(header_event, events, snapshot_envelope, snapshot)
    }

    /// Decode a miniblock read from storage.
    pub fn from_descriptor(descriptor: &MiniblockDescriptor, opts: &MiniblockInfoOpts) -> Result<MiniblockInfo, StreamError> {
        let miniblock = Miniblock::try_from_slice(&descriptor.data).map_err(|err| {
            StreamError::invalid_argument(format!("failed to decode miniblock {}: {}", descriptor.number, err))
        })?;
        let snapshot_envelope = if descriptor.snapshot_envelope.is_empty() {
            None
        } else {
            Some(Envelope::try_from_slice(&descriptor.snapshot_envelope).map_err(|err| {
                StreamError::invalid_argument(format!("failed to decode snapshot of miniblock {}: {}", descriptor.number, err))
            })?)
        };
        let mut opts = opts.clone();
        if opts.expected_block_number.is_none() && descriptor.number > -1 {
            opts.expected_block_number = Some(descriptor.number);
        }
        Self::new(miniblock, snapshot_envelope, &opts)
    }

    pub fn as_storage_mb(&self) -> Result<MiniblockDescriptor, StreamError> {
        let data = self
            .miniblock
            .try_to_vec()
            .map_err(|err| StreamError::internal(format!("failed to serialize miniblock: {}", err)))?;
        let snapshot_envelope = match &self.snapshot_envelope {
            Some(envelope) => envelope
                .try_to_vec()
                .map_err(|err| StreamError::internal(format!("failed to serialize snapshot: {}", err)))?,
            None => Vec::new(),
        };
        Ok(MiniblockDescriptor {
            number: self.miniblock_ref.num,
            hash: self.miniblock_ref.hash,
            data,
            snapshot_envelope,
            has_snapshot: self.header.has_snapshot(),
        })
    }

    pub fn num(&self) -> i64 {
        self.miniblock_ref.num
    }

    pub fn hash(&self) -> CryptoHash {
        self.miniblock_ref.hash
    }

    pub fn header(&self) -> &MiniblockHeader {
        &self.header
    }

    pub fn header_event(&self) -> &ParsedEvent {
        &self.header_event
    }

    pub fn events(&self) -> &[ParsedEvent] {
        &self.events
    }

    pub fn last_event(&self) -> Option<&ParsedEvent> {
        self.events.last()
    }

    /// Materialized snapshot carried by this miniblock, embedded or detached.
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.header.has_snapshot()
    }

    /// Number of the latest miniblock with a snapshot, counting this one.
    pub fn latest_snapshot_num(&self) -> i64 {
        if self.has_snapshot() {
            self.num()
        } else {
            self.header.prev_snapshot_miniblock_num
        }
    }

    /// Visit every event followed by the header event, with their miniblock and event numbers. Stops
    /// early when `op` returns `false`.
    pub fn for_each_event<F>(&self, op: &mut F) -> Result<bool, StreamError>
    where
        F: FnMut(&ParsedEvent, i64, i64) -> Result<bool, StreamError>,
    {
        let mut event_num = self.header.event_num_offset;
        for event in &self.events {
            if !op(event, self.header.miniblock_num, event_num)? {
                return Ok(false);
            }
            event_num += 1;
        }
        op(&self.header_event, self.header.miniblock_num, event_num)
    }
}

/// Timestamp for the miniblock after one stamped `prev`. Strictly increasing even if the clock lags.
pub fn next_miniblock_timestamp(prev: i64) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as i64)
        .unwrap_or_default();
    if now > prev {
        now
    } else {
        prev + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::payloads::{ChannelPayload, EncryptedData};

    fn header(num: i64, prev: CryptoHash, events: &[ParsedEvent]) -> MiniblockHeader {
        MiniblockHeader {
            miniblock_num: num,
            prev_miniblock_hash: prev,
            timestamp: next_miniblock_timestamp(0),
            event_hashes: events.iter().map(|event| event.hash).collect(),
            snapshot: None,
            snapshot_hash: None,
            event_num_offset: 10,
            prev_snapshot_miniblock_num: 0,
        }
    }

    fn message(wallet: &Wallet) -> ParsedEvent {
        let payload = Payload::Channel(ChannelPayload::Message(EncryptedData::default()));
        make_parsed_event(wallet, payload, None).unwrap()
    }

    #[test]
    fn validates_against_opts() {
        let wallet = Wallet::generate();
        let events = vec![message(&wallet), message(&wallet)];
        let prev = CryptoHash::new([9u8; 32]);
        let info = MiniblockInfo::from_header_and_parsed(&wallet, header(3, prev, &events), events, None, None).unwrap();

        let ok = MiniblockInfoOpts::new()
            .with_expected_block_number(3)
            .with_expected_prev_miniblock_hash(prev)
            .with_expected_event_num_offset(10);
        let reparsed = MiniblockInfo::new(info.miniblock.clone(), None, &ok).unwrap();
        assert_eq!(reparsed.miniblock_ref, info.miniblock_ref);
        assert_eq!(reparsed.events().len(), 2);

        let wrong_num = MiniblockInfoOpts::new().with_expected_block_number(4);
        assert!(matches!(MiniblockInfo::new(info.miniblock.clone(), None, &wrong_num), Err(StreamError::BadBlock { .. })));

        let mut reordered = info.miniblock.clone();
        reordered.events.reverse();
        assert!(matches!(MiniblockInfo::new(reordered, None, &MiniblockInfoOpts::new()), Err(StreamError::BadBlock { .. })));
    }

    #[test]
    fn checks_timestamp_and_snapshot_chain() {
        let wallet = Wallet::generate();
        let events = vec![message(&wallet)];
        let mut header = header(2, CryptoHash::zero(), &events);
        header.prev_snapshot_miniblock_num = 1;
        let timestamp = header.timestamp;
        let info = MiniblockInfo::from_header_and_parsed(&wallet, header, events, None, None).unwrap();
        assert_eq!(info.latest_snapshot_num(), 1);

        let ok = MiniblockInfoOpts::new()
            .with_expected_minimum_timestamp_exclusive(timestamp - 1)
            .with_expected_prev_snapshot_miniblock_num(1);
        assert!(MiniblockInfo::new(info.miniblock.clone(), None, &ok).is_ok());

        let stale = MiniblockInfoOpts::new().with_expected_minimum_timestamp_exclusive(timestamp);
        assert!(matches!(MiniblockInfo::new(info.miniblock.clone(), None, &stale), Err(StreamError::BadBlock { .. })));

        let wrong_snapshot = MiniblockInfoOpts::new().with_expected_prev_snapshot_miniblock_num(0);
        assert!(matches!(MiniblockInfo::new(info.miniblock.clone(), None, &wrong_snapshot), Err(StreamError::BadBlock { .. })));
    }

    #[test]
    fn storage_descriptor_round_trip() {
        let wallet = Wallet::generate();
        let events = vec![message(&wallet)];
        let info = MiniblockInfo::from_header_and_parsed(&wallet, header(1, CryptoHash::zero(), &events), events, None, None).unwrap();
        let descriptor = info.as_storage_mb().unwrap();
        assert!(!descriptor.has_snapshot);
        let decoded = MiniblockInfo::from_descriptor(&descriptor, &MiniblockInfoOpts::new()).unwrap();
        assert_eq!(decoded.miniblock_ref, info.miniblock_ref);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let far_future = i64::MAX - 10;
        assert_eq!(next_miniblock_timestamp(far_future), far_future + 1);
        assert!(next_miniblock_timestamp(0) > 0);
    }
}
