use std::sync::Arc;

use streamlog_rs::{
    config::StreamConfig,
    errors::StreamError,
    storage::{kv_storage::KVStreamStorage, MiniblockDescriptor, StreamStorage},
    stream::StreamView,
    types::{
        crypto_primitives::Wallet,
        data_types::StreamId,
        envelope::make_parsed_event,
        miniblock::MiniblockInfo,
        payloads::{ChannelPayload, EncryptedData, Payload},
    },
};

mod common;

use common::{mem_db::MemDB, streams::channel_genesis};

/// A channel's genesis, plus its view after `count` message events were added to the minipool.
fn channel_with_events(wallet: &Wallet, count: usize) -> (StreamId, Arc<MiniblockInfo>, StreamView) {
    let genesis = Arc::new(channel_genesis(wallet));
    let stream_id = genesis.events()[0].payload().inception().unwrap().0.clone();
    let mut view = StreamView::from_genesis(genesis.clone()).unwrap();
    for i in 0..count {
        let payload = Payload::Channel(ChannelPayload::Message(EncryptedData {
            ciphertext: format!("message {}", i),
            ..Default::default()
        }));
        let event = make_parsed_event(wallet, payload, Some(genesis.miniblock_ref)).unwrap();
        view = view.copy_and_add_event(Arc::new(event)).unwrap();
    }
    (stream_id, genesis, view)
}

fn seal(wallet: &Wallet, view: &StreamView, force_snapshot: bool) -> MiniblockDescriptor {
    let config = StreamConfig::default();
    let proposal = view.local_proposal(&config, force_snapshot);
    view.make_miniblock_candidate(wallet, &proposal, &config).unwrap().as_storage_mb().unwrap()
}

/// Tests the life of a stream in storage: creation, events, candidates, miniblocks, and reading it back.
#[test]
fn stream_storage_lifecycle_test() {
    let wallet = Wallet::generate();
    let storage = KVStreamStorage::new(MemDB::new());
    let (stream_id, genesis, view) = channel_with_events(&wallet, 2);
    let genesis_mb = genesis.as_storage_mb().unwrap();

    // 1. Create the stream. A second creation fails.
    storage.create_stream_storage(&stream_id, &genesis_mb).unwrap();
    assert!(storage.create_stream_storage(&stream_id, &genesis_mb).unwrap_err().is_already_exists());
    assert_eq!(storage.get_last_miniblock_number(&stream_id).unwrap(), 0);

    // 2. Write the two events to the minipool. A write to the wrong slot is rejected.
    let envelopes = view.minipool().envelope_bytes().unwrap();
    storage.write_event(&stream_id, 1, 0, &envelopes[0]).unwrap();
    assert!(matches!(
        storage.write_event(&stream_id, 1, 0, &envelopes[1]),
        Err(StreamError::Internal { .. })
    ));
    storage.write_event(&stream_id, 1, 1, &envelopes[1]).unwrap();

    // 3. Store the same candidate twice. It is counted once.
    let candidate = seal(&wallet, &view, false);
    storage.write_miniblock_candidate(&stream_id, &candidate).unwrap();
    storage.write_miniblock_candidate(&stream_id, &candidate).unwrap();
    assert_eq!(storage.get_miniblock_candidate_count(&stream_id, 1).unwrap(), 1);
    let read = storage.read_miniblock_candidate(&stream_id, &candidate.hash, 1).unwrap();
    assert_eq!(read.data, candidate.data);

    // 4. Apply the candidate. The minipool moves to generation 2 and the candidate is pruned.
    assert!(matches!(
        storage.write_miniblocks(&stream_id, &[candidate.clone()], 2, Vec::new(), 1, 1),
        Err(StreamError::Internal { .. })
    ));
    storage.write_miniblocks(&stream_id, &[candidate.clone()], 2, Vec::new(), 1, 2).unwrap();
    assert_eq!(storage.get_last_miniblock_number(&stream_id).unwrap(), 1);
    assert!(storage.read_miniblock_candidate(&stream_id, &candidate.hash, 1).unwrap_err().is_not_found());
    assert!(matches!(
        storage.write_miniblock_candidate(&stream_id, &candidate),
        Err(StreamError::MiniblockTooOld { requested: 1, local: 2, .. })
    ));

    // 5. Read the stream back from its last snapshot, the genesis.
    let stream = storage.read_stream_from_last_snapshot(&stream_id, 0).unwrap();
    assert_eq!(stream.snapshot_miniblock_offset, 0);
    assert_eq!(stream.miniblocks.len(), 2);
    assert_eq!(stream.miniblocks[1].hash, candidate.hash);
    assert!(stream.minipool_envelopes.is_empty());

    let ranges = storage.get_miniblock_number_ranges(&stream_id, 0).unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!((ranges[0].start_inclusive, ranges[0].end_inclusive), (0, 1));
    assert_eq!(ranges[0].snapshot_seq_nums, vec![0]);
}

/// Tests reinitializing a stream from a later snapshot and backfilling the gap that leaves.
#[test]
fn reinitialize_and_backfill_test() {
    let wallet = Wallet::generate();
    let config = StreamConfig::default();

    // 1. Build a three miniblock stream in memory. The last miniblock carries a snapshot.
    let (stream_id, genesis, view) = channel_with_events(&wallet, 1);
    let first = view.make_miniblock_candidate(&wallet, &view.local_proposal(&config, false), &config).unwrap();
    let (view, _) = view.copy_and_apply_block(Arc::new(first.clone()), &config).unwrap();
    let second = view.make_miniblock_candidate(&wallet, &view.local_proposal(&config, true), &config).unwrap();
    assert!(second.has_snapshot());
    let (genesis, first, second) =
        (genesis.as_storage_mb().unwrap(), first.as_storage_mb().unwrap(), second.as_storage_mb().unwrap());

    // 2. A node without the stream reinitializes it from the snapshot alone.
    let storage = KVStreamStorage::new(MemDB::new());
    assert!(storage.reinitialize_stream_storage(&stream_id, &[second.clone()], 2, true).unwrap_err().is_not_found());
    storage.reinitialize_stream_storage(&stream_id, &[second.clone()], 2, false).unwrap();
    assert!(storage.reinitialize_stream_storage(&stream_id, &[second.clone()], 2, false).unwrap_err().is_already_exists());
    assert_eq!(storage.get_last_miniblock_number(&stream_id).unwrap(), 2);
    assert_eq!(storage.read_miniblocks(&stream_id, 0, 3).unwrap().len(), 0);

    // 3. Backfill the gap. Miniblocks at or past the last one are rejected.
    assert!(storage.write_preceding_miniblocks(&stream_id, &[first.clone(), second.clone()]).is_err());
    storage.write_preceding_miniblocks(&stream_id, &[genesis, first]).unwrap();
    let ranges = storage.get_miniblock_number_ranges(&stream_id, 0).unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!((ranges[0].start_inclusive, ranges[0].end_inclusive), (0, 2));
    assert_eq!(ranges[0].snapshot_seq_nums, vec![0, 2]);
    assert_eq!(storage.read_miniblocks(&stream_id, 0, 3).unwrap().len(), 3);

    // 4. Reading from the last snapshot starts at miniblock 2, preceded by as many as asked for.
    let stream = storage.read_stream_from_last_snapshot(&stream_id, 1).unwrap();
    assert_eq!(stream.snapshot_miniblock_offset, 1);
    assert_eq!(stream.miniblocks.len(), 2);
}
