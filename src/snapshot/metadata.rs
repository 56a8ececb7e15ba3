/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::errors::StreamError;
use crate::types::payloads::MetadataPayload;
use crate::types::snapshot::{MetadataStreamRecord, Snapshot, SnapshotContent};

use super::sorted::{find_sorted, insert_sorted};
use super::wrong_content;

pub(super) fn update_metadata(snapshot: &mut Snapshot, payload: &MetadataPayload) -> Result<(), StreamError> {
    let metadata = match &mut snapshot.content {
        SnapshotContent::Metadata(metadata) => metadata,
        _ => return Err(wrong_content("metadata")),
    };
    match payload {
        MetadataPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        MetadataPayload::NewStream { stream_id, genesis_miniblock_hash, nodes, replication_factor } => {
            insert_sorted(
                &mut metadata.stream_records,
                MetadataStreamRecord {
                    stream_id: stream_id.clone(),
                    genesis_miniblock_hash: *genesis_miniblock_hash,
                    last_miniblock_hash: *genesis_miniblock_hash,
                    last_miniblock_num: 0,
                    nodes: nodes.clone(),
                    replication_factor: *replication_factor,
                },
                |record| &record.stream_id,
            );
            Ok(())
        }
        MetadataPayload::LastMiniblockUpdate { stream_id, last_miniblock_hash, last_miniblock_num } => {
            let i = find_sorted(&metadata.stream_records, stream_id, |record| &record.stream_id)
                .ok_or_else(|| StreamError::not_found(format!("stream record {}", stream_id)))?;
            let record = &mut metadata.stream_records[i];
            record.last_miniblock_hash = *last_miniblock_hash;
            record.last_miniblock_num = *last_miniblock_num;
            Ok(())
        }
        MetadataPayload::PlacementUpdate { stream_id, nodes, replication_factor } => {
            let i = find_sorted(&metadata.stream_records, stream_id, |record| &record.stream_id)
                .ok_or_else(|| StreamError::not_found(format!("stream record {}", stream_id)))?;
            let record = &mut metadata.stream_records[i];
            record.nodes = nodes.clone();
            record.replication_factor = *replication_factor;
            Ok(())
        }
    }
}
