/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Data model of materialized stream snapshots.
//!
//! Lists that are searched by key (members, channels, memberships, markers, stream records) are kept sorted
//! by that key so that the folding engine can binary search them. Maps keyed by strings are `BTreeMap`s so
//! that the borsh encoding, and therefore the snapshot hash, is deterministic.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{Address, CryptoHash, StreamId};
use super::payloads::{
    ChannelInception, ChannelOp, ChannelSettings, DmChannelInception, EncryptedData, GdmChannelInception,
    MediaInception, MemberNft, MembershipOp, MetadataInception, SpaceInception, StreamSettings, UserInboxInception,
    UserInception, UserMetadataInception, UserSettingsInception,
};

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Snapshot {
    pub content: SnapshotContent,
    pub members: Members,
    pub snapshot_version: i32,
}

impl Snapshot {
    /// Stream id and settings from the inception baked into this snapshot.
    pub fn inception(&self) -> (&StreamId, &StreamSettings) {
        match &self.content {
            SnapshotContent::Space(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::Channel(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::DmChannel(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::GdmChannel(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::User(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::UserSettings(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::UserMetadata(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::UserInbox(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::Media(s) => (&s.inception.stream_id, &s.inception.settings),
            SnapshotContent::Metadata(s) => (&s.inception.stream_id, &s.inception.settings),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum SnapshotContent {
    Space(SpaceSnapshot),
    Channel(ChannelSnapshot),
    DmChannel(DmChannelSnapshot),
    GdmChannel(GdmChannelSnapshot),
    User(UserSnapshot),
    UserSettings(UserSettingsSnapshot),
    UserMetadata(UserMetadataSnapshot),
    UserInbox(UserInboxSnapshot),
    Media(MediaSnapshot),
    Metadata(MetadataSnapshot),
}

/// Encrypted data together with the event that set it.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WrappedEncryptedData {
    pub data: EncryptedData,
    pub event_num: i64,
    pub event_hash: CryptoHash,
}

/* ↓↓↓ Space ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SpaceSnapshot {
    pub inception: SpaceInception,
    /// Sorted by `channel_id`.
    pub channels: Vec<ChannelMetadata>,
    pub space_image: Option<SnappedSpaceImage>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChannelMetadata {
    pub channel_id: StreamId,
    pub operation: ChannelOp,
    pub origin_event: CryptoHash,
    pub updated_at_event_num: i64,
    pub settings: ChannelSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SnappedSpaceImage {
    pub data: EncryptedData,
    pub creator: Address,
    pub event_num: i64,
    pub event_hash: CryptoHash,
}

/* ↓↓↓ Channel, DM, GDM, Media ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChannelSnapshot {
    pub inception: ChannelInception,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DmChannelSnapshot {
    pub inception: DmChannelInception,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct GdmChannelSnapshot {
    pub inception: GdmChannelInception,
    pub channel_properties: Option<WrappedEncryptedData>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MediaSnapshot {
    pub inception: MediaInception,
}

/* ↓↓↓ User streams ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserSnapshot {
    pub inception: UserInception,
    /// Sorted by `stream_id`.
    pub memberships: Vec<UserMembershipEntry>,
    pub tips_sent: BTreeMap<String, u64>,
    pub tips_received: BTreeMap<String, u64>,
    pub tips_sent_count: BTreeMap<String, u64>,
    pub tips_received_count: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserMembershipEntry {
    pub stream_id: StreamId,
    pub op: MembershipOp,
    pub inviter: Option<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserSettingsSnapshot {
    pub inception: UserSettingsInception,
    /// Sorted by `stream_id`.
    pub fully_read_markers: Vec<FullyReadMarkers>,
    /// Sorted by `user`.
    pub user_block_lists: Vec<UserBlockList>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct FullyReadMarkers {
    pub stream_id: StreamId,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserBlockList {
    pub user: Address,
    pub blocks: Vec<UserBlock>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserBlock {
    pub is_blocked: bool,
    pub event_num: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserMetadataSnapshot {
    pub inception: UserMetadataInception,
    /// Oldest first, most recent last.
    pub encryption_devices: Vec<UserDevice>,
    pub profile_image: Option<WrappedEncryptedData>,
    pub bio: Option<WrappedEncryptedData>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserDevice {
    pub device_key: String,
    pub fallback_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserInboxSnapshot {
    pub inception: UserInboxInception,
    pub device_summary: BTreeMap<String, DeviceSummary>,
}

/// Range of miniblocks holding undelivered sessions for one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DeviceSummary {
    pub lower_bound: i64,
    pub upper_bound: i64,
}

/* ↓↓↓ Metadata ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MetadataSnapshot {
    pub inception: MetadataInception,
    /// Sorted by `stream_id`.
    pub stream_records: Vec<MetadataStreamRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MetadataStreamRecord {
    pub stream_id: StreamId,
    pub genesis_miniblock_hash: CryptoHash,
    pub last_miniblock_hash: CryptoHash,
    pub last_miniblock_num: i64,
    pub nodes: Vec<Address>,
    pub replication_factor: u32,
}

/* ↓↓↓ Members ↓↓↓ */

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Members {
    /// Sorted by `user_address`.
    pub joined: Vec<Member>,
    pub pins: Vec<SnappedPin>,
    pub encryption_algorithm: Option<String>,
    pub tips: BTreeMap<String, u64>,
    pub tips_count: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Member {
    pub user_address: Address,
    pub miniblock_num: i64,
    pub event_num: i64,
    pub app_address: Option<Address>,
    pub sponsor: Option<Address>,
    /// Oldest first, at most ten retained.
    pub solicitations: Vec<MemberSolicitation>,
    pub display_name: Option<WrappedEncryptedData>,
    pub username: Option<WrappedEncryptedData>,
    pub ens_address: Vec<u8>,
    pub nft: Option<MemberNft>,
    pub tips_sent: BTreeMap<String, u64>,
    pub tips_received: BTreeMap<String, u64>,
    pub tips_sent_count: BTreeMap<String, u64>,
    pub tips_received_count: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MemberSolicitation {
    pub device_key: String,
    pub fallback_key: String,
    pub is_new_device: bool,
    /// Sorted.
    pub session_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SnappedPin {
    pub event_id: CryptoHash,
    pub event: Vec<u8>,
    pub creator: Address,
}
