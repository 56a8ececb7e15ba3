/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Payloads of stream events.
//!
//! [`Payload`] is a closed sum type with one variant per stream area. Every area has an `Inception`
//! variant that only ever appears as the first event of a stream's genesis miniblock; the remaining
//! variants are the events that are folded into the area's snapshot (see [`crate::snapshot`]).

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{Address, CryptoHash, StreamId};
use super::miniblock::MiniblockHeader;

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum Payload {
    MiniblockHeader(MiniblockHeader),
    Space(SpacePayload),
    Channel(ChannelPayload),
    DmChannel(DmChannelPayload),
    GdmChannel(GdmChannelPayload),
    User(UserPayload),
    UserSettings(UserSettingsPayload),
    UserMetadata(UserMetadataPayload),
    UserInbox(UserInboxPayload),
    Member(MemberPayload),
    Media(MediaPayload),
    Metadata(MetadataPayload),
}

impl Payload {
    /// The stream id and settings carried by an inception payload.
    pub fn inception(&self) -> Option<(&StreamId, &StreamSettings)> {
        match self {
            Payload::Space(SpacePayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::Channel(ChannelPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::DmChannel(DmChannelPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::GdmChannel(GdmChannelPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::User(UserPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::UserSettings(UserSettingsPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::UserMetadata(UserMetadataPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::UserInbox(UserInboxPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::Media(MediaPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            Payload::Metadata(MetadataPayload::Inception(i)) => Some((&i.stream_id, &i.settings)),
            _ => None,
        }
    }

    pub fn is_miniblock_header(&self) -> bool {
        matches!(self, Payload::MiniblockHeader(_))
    }

    /// Short name of the payload case, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::MiniblockHeader(_) => "miniblock_header",
            Payload::Space(_) => "space",
            Payload::Channel(_) => "channel",
            Payload::DmChannel(_) => "dm_channel",
            Payload::GdmChannel(_) => "gdm_channel",
            Payload::User(_) => "user",
            Payload::UserSettings(_) => "user_settings",
            Payload::UserMetadata(_) => "user_metadata",
            Payload::UserInbox(_) => "user_inbox",
            Payload::Member(_) => "member",
            Payload::Media(_) => "media",
            Payload::Metadata(_) => "metadata",
        }
    }
}

/// Settings fixed at stream creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct StreamSettings {
    /// Streams with this flag never have miniblocks produced for them.
    pub disable_miniblock_creation: bool,
}

/// Opaque client-encrypted content.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct EncryptedData {
    pub ciphertext: String,
    pub algorithm: String,
    pub sender_key: String,
    pub session_id: String,
}

/* ↓↓↓ Space ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum SpacePayload {
    Inception(SpaceInception),
    Channel(ChannelUpdate),
    UpdateChannelAutojoin { channel_id: StreamId, autojoin: bool },
    UpdateChannelHideUserJoinLeaveEvents { channel_id: StreamId, hide_user_join_leave_events: bool },
    SpaceImage(EncryptedData),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SpaceInception {
    pub stream_id: StreamId,
    pub settings: StreamSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum ChannelOp {
    Unspecified,
    Created,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChannelUpdate {
    pub op: ChannelOp,
    pub channel_id: StreamId,
    pub origin_event: CryptoHash,
    pub settings: Option<ChannelSettings>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChannelSettings {
    pub autojoin: bool,
    pub hide_user_join_leave_events: bool,
}

/* ↓↓↓ Channel, DM, GDM ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum ChannelPayload {
    Inception(ChannelInception),
    Message(EncryptedData),
    Redaction { event_id: CryptoHash },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ChannelInception {
    pub stream_id: StreamId,
    pub space_id: StreamId,
    pub settings: StreamSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum DmChannelPayload {
    Inception(DmChannelInception),
    Message(EncryptedData),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DmChannelInception {
    pub stream_id: StreamId,
    pub first_party: Address,
    pub second_party: Address,
    pub settings: StreamSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum GdmChannelPayload {
    Inception(GdmChannelInception),
    Message(EncryptedData),
    ChannelProperties(EncryptedData),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct GdmChannelInception {
    pub stream_id: StreamId,
    pub channel_properties: Option<EncryptedData>,
    pub settings: StreamSettings,
}

/* ↓↓↓ User streams ↓↓↓ */

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum MembershipOp {
    Unspecified,
    Invite,
    Join,
    Leave,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum UserPayload {
    Inception(UserInception),
    UserMembership(UserMembership),
    UserMembershipAction { stream_id: StreamId, user: Address, op: MembershipOp },
    /// A transaction initiated by the owner of the stream.
    BlockchainTransaction(BlockchainTransaction),
    /// A transaction that credits the owner of the stream.
    ReceivedBlockchainTransaction(BlockchainTransaction),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserInception {
    pub stream_id: StreamId,
    pub settings: StreamSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserMembership {
    pub stream_id: StreamId,
    pub op: MembershipOp,
    pub inviter: Option<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockchainTransaction {
    pub receipt_hash: CryptoHash,
    pub content: TransactionContent,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum TransactionContent {
    Tip(Tip),
    TokenTransfer { address: Vec<u8>, amount: String, is_buy: bool },
    SpaceReview { space_id: StreamId, rating: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Tip {
    /// Currency contract, hex encoded.
    pub currency: String,
    pub amount: u64,
    pub sender: Address,
    pub receiver: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum UserSettingsPayload {
    Inception(UserSettingsInception),
    FullyReadMarkers { stream_id: StreamId, content: String },
    UserBlockingAction { user: Address, is_blocked: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserSettingsInception {
    pub stream_id: StreamId,
    pub settings: StreamSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum UserMetadataPayload {
    Inception(UserMetadataInception),
    EncryptionDevice { device_key: String, fallback_key: String },
    ProfileImage(EncryptedData),
    Bio(EncryptedData),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserMetadataInception {
    pub stream_id: StreamId,
    pub settings: StreamSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum UserInboxPayload {
    Inception(UserInboxInception),
    GroupEncryptionSessions(GroupEncryptionSessions),
    Ack { device_key: String, miniblock_num: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UserInboxInception {
    pub stream_id: StreamId,
    pub settings: StreamSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct GroupEncryptionSessions {
    pub stream_id: StreamId,
    pub sender_key: String,
    pub session_ids: Vec<String>,
    /// Device key to ciphertext.
    pub ciphertexts: BTreeMap<String, String>,
}

/* ↓↓↓ Member ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum MemberPayload {
    Membership(Membership),
    KeySolicitation(KeySolicitation),
    KeyFulfillment { user: Address, device_key: String, session_ids: Vec<String> },
    DisplayName(EncryptedData),
    Username(EncryptedData),
    EnsAddress(Vec<u8>),
    Nft(MemberNft),
    Pin { event_id: CryptoHash, event: Vec<u8> },
    Unpin { event_id: CryptoHash },
    EncryptionAlgorithm { algorithm: Option<String> },
    MemberBlockchainTransaction { from_user: Address, transaction: BlockchainTransaction },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Membership {
    pub op: MembershipOp,
    pub user: Address,
    pub initiator: Address,
    pub app_address: Option<Address>,
    pub sponsor: Option<Address>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct KeySolicitation {
    pub device_key: String,
    pub fallback_key: String,
    pub is_new_device: bool,
    pub session_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MemberNft {
    pub chain_id: u64,
    pub contract_address: Vec<u8>,
    pub token_id: Vec<u8>,
}

/* ↓↓↓ Media ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum MediaPayload {
    Inception(MediaInception),
    Chunk { data: Vec<u8>, chunk_index: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MediaInception {
    pub stream_id: StreamId,
    pub channel_id: Option<StreamId>,
    pub chunk_count: u32,
    pub settings: StreamSettings,
}

/* ↓↓↓ Metadata ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum MetadataPayload {
    Inception(MetadataInception),
    NewStream {
        stream_id: StreamId,
        genesis_miniblock_hash: CryptoHash,
        nodes: Vec<Address>,
        replication_factor: u32,
    },
    LastMiniblockUpdate {
        stream_id: StreamId,
        last_miniblock_hash: CryptoHash,
        last_miniblock_num: i64,
    },
    PlacementUpdate {
        stream_id: StreamId,
        nodes: Vec<Address>,
        replication_factor: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct MetadataInception {
    pub stream_id: StreamId,
    pub settings: StreamSettings,
}
