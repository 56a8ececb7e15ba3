/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Folding of events into materialized stream snapshots.
//!
//! A [`Snapshot`] is the state of a stream after applying every event up to and including some miniblock.
//! The genesis snapshot is built from the inception event by [`make_genesis_snapshot`], and each later
//! event is applied with [`update_snapshot`]. Folding is a pure function of the snapshot and the event,
//! so every replica that folds the same events in the same order arrives at the same snapshot bytes and
//! therefore the same snapshot hash.
//!
//! ## Snapshot storage formats
//!
//! Legacy miniblocks embed the snapshot in the header. New format miniblocks put only the hash of the
//! snapshot in the header and carry the snapshot in a separate envelope signed by the header's signer,
//! built with [`make_snapshot_envelope`] and verified with [`parse_snapshot`].

mod member;
mod metadata;
mod space;
pub(crate) mod sorted;
mod user;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::StreamError;
use crate::types::crypto_primitives::{hash_snapshot, verify, Wallet};
use crate::types::data_types::{Address, CryptoHash};
use crate::types::envelope::{Envelope, ParsedEvent};
use crate::types::miniblock::{next_miniblock_timestamp, MiniblockHeader, MiniblockInfo};
use crate::types::payloads::{
    ChannelPayload, DmChannelPayload, GdmChannelPayload, MediaPayload, MetadataPayload, Payload, SpacePayload,
    UserInboxPayload, UserMetadataPayload, UserPayload, UserSettingsPayload,
};
use crate::types::snapshot::{
    ChannelSnapshot, DmChannelSnapshot, GdmChannelSnapshot, MediaSnapshot, Member, Members, MetadataSnapshot,
    Snapshot, SnapshotContent, SpaceSnapshot, UserInboxSnapshot, UserMetadataSnapshot, UserSettingsSnapshot,
    UserSnapshot,
};

pub(crate) use member::MAX_SOLICITATIONS;
pub(crate) use user::{MAX_DEVICE_SUMMARY_GAP, MAX_ENCRYPTION_DEVICES};

/// Version stamped on every snapshot produced by this crate.
pub const SNAPSHOT_VERSION: i32 = 2;

/// Apply `event`, which is event number `event_num` of miniblock `miniblock_num`, to `snapshot`.
pub fn update_snapshot(
    snapshot: &mut Snapshot,
    event: &ParsedEvent,
    miniblock_num: i64,
    event_num: i64,
) -> Result<(), StreamError> {
    match event.payload() {
        Payload::MiniblockHeader(_) => Err(StreamError::invalid_argument("cannot fold a miniblock header into a snapshot")),
        Payload::Space(payload) => space::update_space(snapshot, payload, event, event_num),
        Payload::Channel(payload) => space::update_channel(snapshot, payload),
        Payload::DmChannel(payload) => space::update_dm_channel(snapshot, payload),
        Payload::GdmChannel(payload) => space::update_gdm_channel(snapshot, payload, event, event_num),
        Payload::User(payload) => user::update_user(snapshot, payload),
        Payload::UserSettings(payload) => user::update_user_settings(snapshot, payload, event_num),
        Payload::UserMetadata(payload) => user::update_user_metadata(snapshot, payload, event, event_num),
        Payload::UserInbox(payload) => user::update_user_inbox(snapshot, payload, miniblock_num),
        Payload::Member(payload) => member::update_members(&mut snapshot.members, payload, event, miniblock_num, event_num),
        Payload::Media(_) => Err(StreamError::invalid_argument("media streams do not have snapshot updates")),
        Payload::Metadata(payload) => metadata::update_metadata(snapshot, payload),
    }
}

fn wrong_content(expected: &str) -> StreamError {
    StreamError::invalid_argument(format!("event is for a {} stream but the snapshot is not", expected))
}

/// Build the snapshot of a stream from the events of its genesis miniblock. The first event must be an
/// inception event.
pub fn make_genesis_snapshot(events: &[ParsedEvent]) -> Result<Snapshot, StreamError> {
    let inception = events
        .first()
        .ok_or_else(|| StreamError::invalid_argument("genesis miniblock has no events"))?;

    let content = match inception.payload() {
        Payload::Space(SpacePayload::Inception(i)) => {
            SnapshotContent::Space(SpaceSnapshot { inception: i.clone(), channels: Vec::new(), space_image: None })
        }
        Payload::Channel(ChannelPayload::Inception(i)) => SnapshotContent::Channel(ChannelSnapshot { inception: i.clone() }),
        Payload::DmChannel(DmChannelPayload::Inception(i)) => {
            SnapshotContent::DmChannel(DmChannelSnapshot { inception: i.clone() })
        }
        Payload::GdmChannel(GdmChannelPayload::Inception(i)) => {
            SnapshotContent::GdmChannel(GdmChannelSnapshot { inception: i.clone(), channel_properties: None })
        }
        Payload::User(UserPayload::Inception(i)) => SnapshotContent::User(UserSnapshot {
            inception: i.clone(),
            memberships: Vec::new(),
            tips_sent: Default::default(),
            tips_received: Default::default(),
            tips_sent_count: Default::default(),
            tips_received_count: Default::default(),
        }),
        Payload::UserSettings(UserSettingsPayload::Inception(i)) => SnapshotContent::UserSettings(UserSettingsSnapshot {
            inception: i.clone(),
            fully_read_markers: Vec::new(),
            user_block_lists: Vec::new(),
        }),
        Payload::UserMetadata(UserMetadataPayload::Inception(i)) => SnapshotContent::UserMetadata(UserMetadataSnapshot {
            inception: i.clone(),
            encryption_devices: Vec::new(),
            profile_image: None,
            bio: None,
        }),
        Payload::UserInbox(UserInboxPayload::Inception(i)) => SnapshotContent::UserInbox(UserInboxSnapshot {
            inception: i.clone(),
            device_summary: Default::default(),
        }),
        Payload::Media(MediaPayload::Inception(i)) => SnapshotContent::Media(MediaSnapshot { inception: i.clone() }),
        Payload::Metadata(MetadataPayload::Inception(i)) => {
            SnapshotContent::Metadata(MetadataSnapshot { inception: i.clone(), stream_records: Vec::new() })
        }
        _ => return Err(StreamError::invalid_argument("first genesis event must be an inception")),
    };

    let mut joined: Vec<Address> = match &content {
        SnapshotContent::User(s) => s.inception.stream_id.user_address().into_iter().collect(),
        SnapshotContent::UserSettings(s) => s.inception.stream_id.user_address().into_iter().collect(),
        SnapshotContent::UserMetadata(s) => s.inception.stream_id.user_address().into_iter().collect(),
        SnapshotContent::UserInbox(s) => s.inception.stream_id.user_address().into_iter().collect(),
        SnapshotContent::DmChannel(s) => vec![s.inception.first_party, s.inception.second_party],
        SnapshotContent::Media(_) => vec![*inception.creator()],
        _ => Vec::new(),
    };
    joined.sort();
    joined.dedup();

    let mut snapshot = Snapshot {
        content,
        members: Members {
            joined: joined
                .into_iter()
                .map(|user_address| Member { user_address, ..Default::default() })
                .collect(),
            ..Default::default()
        },
        snapshot_version: SNAPSHOT_VERSION,
    };

    for (i, event) in events[1..].iter().enumerate() {
        update_snapshot(&mut snapshot, event, 0, 1 + i as i64)?;
    }
    Ok(snapshot)
}

/// Serialize, hash and sign a snapshot for the new storage format.
pub fn make_snapshot_envelope(wallet: &Wallet, snapshot: &Snapshot) -> Result<Envelope, StreamError> {
    let bytes = snapshot
        .try_to_vec()
        .map_err(|err| StreamError::internal(format!("failed to serialize snapshot: {}", err)))?;
    let hash = hash_snapshot(&bytes);
    let signature = wallet.sign(&hash.bytes());
    Ok(Envelope { hash, signature, event: bytes })
}

/// Verify a snapshot envelope against `signer` and decode the snapshot in it.
pub fn parse_snapshot(envelope: &Envelope, signer: &Address) -> Result<Snapshot, StreamError> {
    let computed = hash_snapshot(&envelope.event);
    if computed != envelope.hash {
        return Err(StreamError::BadEventHash { expected: envelope.hash, actual: computed });
    }
    verify(signer, &envelope.hash.bytes(), &envelope.signature).map_err(|err| StreamError::BadEventSignature {
        event: envelope.hash,
        reason: format!("snapshot signature: {}", err),
    })?;
    Snapshot::try_from_slice(&envelope.event)
        .map_err(|err| StreamError::bad_event(format!("failed to decode snapshot {}: {}", envelope.hash, err)))
}

/// Seal `events` into miniblock 0, with the genesis snapshot embedded in the header or, when
/// `new_snapshot_format` is set, in a separate envelope.
pub fn make_genesis_miniblock(
    wallet: &Wallet,
    events: Vec<ParsedEvent>,
    new_snapshot_format: bool,
) -> Result<MiniblockInfo, StreamError> {
    let snapshot = make_genesis_snapshot(&events)?;
    let (embedded, snapshot_envelope) = if new_snapshot_format {
        (None, Some(make_snapshot_envelope(wallet, &snapshot)?))
    } else {
        (Some(snapshot.clone()), None)
    };

    let header = MiniblockHeader {
        miniblock_num: 0,
        prev_miniblock_hash: CryptoHash::zero(),
        timestamp: next_miniblock_timestamp(0),
        event_hashes: events.iter().map(|event| event.hash).collect(),
        snapshot: embedded,
        snapshot_hash: snapshot_envelope.as_ref().map(|envelope| envelope.hash),
        event_num_offset: 0,
        prev_snapshot_miniblock_num: 0,
    };
    MiniblockInfo::from_header_and_parsed(wallet, header, events, snapshot_envelope, Some(snapshot))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::data_types::{StreamId, StreamType};
    use crate::types::envelope::make_parsed_event;
    use crate::types::miniblock::MiniblockInfoOpts;
    use crate::types::payloads::*;
    use crate::types::snapshot::DeviceSummary;

    fn event(wallet: &Wallet, payload: Payload) -> ParsedEvent {
        make_parsed_event(wallet, payload, None).unwrap()
    }

    fn join(wallet: &Wallet, user: Address) -> ParsedEvent {
        event(
            wallet,
            Payload::Member(MemberPayload::Membership(Membership {
                op: MembershipOp::Join,
                user,
                initiator: user,
                app_address: None,
                sponsor: None,
            })),
        )
    }

    fn space_genesis(wallet: &Wallet) -> (StreamId, Vec<ParsedEvent>) {
        let space_id = StreamId::random(StreamType::Space);
        let inception = event(
            wallet,
            Payload::Space(SpacePayload::Inception(SpaceInception {
                stream_id: space_id.clone(),
                settings: StreamSettings::default(),
            })),
        );
        (space_id, vec![inception, join(wallet, wallet.address())])
    }

    #[test]
    fn genesis_members_by_stream_type() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();

        // 1. User streams start with their owner as the only member.
        let user_id = StreamId::for_user(StreamType::User, &alice.address());
        let inception = event(
            &alice,
            Payload::User(UserPayload::Inception(UserInception { stream_id: user_id, settings: StreamSettings::default() })),
        );
        let snapshot = make_genesis_snapshot(&[inception]).unwrap();
        assert_eq!(snapshot.members.joined.len(), 1);
        assert_eq!(snapshot.members.joined[0].user_address, alice.address());
        assert_eq!(snapshot.snapshot_version, SNAPSHOT_VERSION);

        // 2. DM streams start with both parties.
        let inception = event(
            &alice,
            Payload::DmChannel(DmChannelPayload::Inception(DmChannelInception {
                stream_id: StreamId::for_dm(&alice.address(), &bob.address()),
                first_party: alice.address(),
                second_party: bob.address(),
                settings: StreamSettings::default(),
            })),
        );
        let snapshot = make_genesis_snapshot(&[inception]).unwrap();
        assert_eq!(snapshot.members.joined.len(), 2);
        assert!(snapshot.members.joined[0].user_address < snapshot.members.joined[1].user_address);

        // 3. Spaces start empty and pick up members from the genesis join.
        let (_, events) = space_genesis(&alice);
        let snapshot = make_genesis_snapshot(&events).unwrap();
        assert_eq!(snapshot.members.joined.len(), 1);
        assert_eq!(snapshot.members.joined[0].event_num, 1);

        // 4. A genesis without an inception is rejected.
        assert!(make_genesis_snapshot(&[join(&alice, alice.address())]).is_err());
        assert!(make_genesis_snapshot(&[]).is_err());
    }

    #[test]
    fn space_channels_fold_in_sorted_order() {
        let wallet = Wallet::generate();
        let (space_id, events) = space_genesis(&wallet);
        let mut snapshot = make_genesis_snapshot(&events).unwrap();

        let default_channel = StreamId::default_channel_for(&space_id);
        let other_channel = StreamId::random(StreamType::Channel);
        for (i, channel_id) in [other_channel.clone(), default_channel.clone()].iter().enumerate() {
            let created = event(
                &wallet,
                Payload::Space(SpacePayload::Channel(ChannelUpdate {
                    op: ChannelOp::Created,
                    channel_id: channel_id.clone(),
                    origin_event: CryptoHash::zero(),
                    settings: None,
                })),
            );
            update_snapshot(&mut snapshot, &created, 1, 2 + i as i64).unwrap();
        }

        let space = match &snapshot.content {
            SnapshotContent::Space(space) => space.clone(),
            _ => panic!("expected a space snapshot"),
        };
        assert_eq!(space.channels.len(), 2);
        assert!(space.channels[0].channel_id < space.channels[1].channel_id);
        for channel in &space.channels {
            assert_eq!(channel.settings.autojoin, channel.channel_id == default_channel);
        }

        // Updating a channel with no settings keeps the existing settings.
        let updated = event(
            &wallet,
            Payload::Space(SpacePayload::Channel(ChannelUpdate {
                op: ChannelOp::Updated,
                channel_id: default_channel.clone(),
                origin_event: CryptoHash::zero(),
                settings: None,
            })),
        );
        update_snapshot(&mut snapshot, &updated, 2, 10).unwrap();
        if let SnapshotContent::Space(space) = &snapshot.content {
            let channel = space.channels.iter().find(|c| c.channel_id == default_channel).unwrap();
            assert!(channel.settings.autojoin);
            assert_eq!(channel.updated_at_event_num, 10);
            assert_eq!(channel.operation, ChannelOp::Updated);
        }

        // Updating an unknown channel without settings fails.
        let unknown = event(
            &wallet,
            Payload::Space(SpacePayload::Channel(ChannelUpdate {
                op: ChannelOp::Updated,
                channel_id: StreamId::random(StreamType::Channel),
                origin_event: CryptoHash::zero(),
                settings: None,
            })),
        );
        assert!(update_snapshot(&mut snapshot, &unknown, 2, 11).unwrap_err().is_not_found());

        // Wrong stream type.
        let user_event = event(&wallet, Payload::UserInbox(UserInboxPayload::Ack { device_key: "d".to_string(), miniblock_num: 1 }));
        assert!(update_snapshot(&mut snapshot, &user_event, 2, 12).is_err());
    }

    #[test]
    fn member_solicitations_and_fulfillments() {
        let wallet = Wallet::generate();
        let (_, events) = space_genesis(&wallet);
        let mut snapshot = make_genesis_snapshot(&events).unwrap();

        let solicit = |device: &str, sessions: &[&str]| {
            event(
                &wallet,
                Payload::Member(MemberPayload::KeySolicitation(KeySolicitation {
                    device_key: device.to_string(),
                    fallback_key: "fallback".to_string(),
                    is_new_device: true,
                    session_ids: sessions.iter().map(|s| s.to_string()).collect(),
                })),
            )
        };

        // 1. Only the most recent solicitations are kept.
        for i in 0..(MAX_SOLICITATIONS + 2) {
            update_snapshot(&mut snapshot, &solicit(&format!("device{}", i), &["b", "a"]), 1, 2 + i as i64).unwrap();
        }
        let member = &snapshot.members.joined[0];
        assert_eq!(member.solicitations.len(), MAX_SOLICITATIONS);
        assert_eq!(member.solicitations[0].device_key, "device2");
        assert_eq!(member.solicitations[0].session_ids, vec!["a".to_string(), "b".to_string()]);

        // 2. A partial fulfillment removes sessions, a full one removes the solicitation.
        let fulfill = |sessions: &[&str]| {
            event(
                &wallet,
                Payload::Member(MemberPayload::KeyFulfillment {
                    user: wallet.address(),
                    device_key: "device2".to_string(),
                    session_ids: sessions.iter().map(|s| s.to_string()).collect(),
                }),
            )
        };
        update_snapshot(&mut snapshot, &fulfill(&["a"]), 2, 20).unwrap();
        let solicitation = &snapshot.members.joined[0].solicitations[0];
        assert_eq!(solicitation.session_ids, vec!["b".to_string()]);
        assert!(!solicitation.is_new_device);
        update_snapshot(&mut snapshot, &fulfill(&["b"]), 2, 21).unwrap();
        assert_eq!(snapshot.members.joined[0].solicitations.len(), MAX_SOLICITATIONS - 1);

        // 3. Solicitations from non-members fail.
        let stranger = Wallet::generate();
        let stranger_event = event(
            &stranger,
            Payload::Member(MemberPayload::KeySolicitation(KeySolicitation::default())),
        );
        assert!(update_snapshot(&mut snapshot, &stranger_event, 2, 22).unwrap_err().is_not_found());

        // 4. Leave removes the member.
        let leave = event(
            &wallet,
            Payload::Member(MemberPayload::Membership(Membership {
                op: MembershipOp::Leave,
                user: wallet.address(),
                initiator: wallet.address(),
                app_address: None,
                sponsor: None,
            })),
        );
        update_snapshot(&mut snapshot, &leave, 3, 23).unwrap();
        assert!(snapshot.members.joined.is_empty());
    }

    #[test]
    fn member_tips_are_counted() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let (_, mut events) = space_genesis(&alice);
        events.push(join(&alice, bob.address()));
        let mut snapshot = make_genesis_snapshot(&events).unwrap();

        let tip = event(
            &alice,
            Payload::Member(MemberPayload::MemberBlockchainTransaction {
                from_user: alice.address(),
                transaction: BlockchainTransaction {
                    receipt_hash: CryptoHash::zero(),
                    content: TransactionContent::Tip(Tip {
                        currency: "eth".to_string(),
                        amount: 7,
                        sender: alice.address(),
                        receiver: bob.address(),
                    }),
                },
            }),
        );
        update_snapshot(&mut snapshot, &tip, 1, 3).unwrap();
        update_snapshot(&mut snapshot, &tip, 1, 4).unwrap();

        assert_eq!(snapshot.members.tips.get("eth"), Some(&14));
        assert_eq!(snapshot.members.tips_count.get("eth"), Some(&2));
        let sender = snapshot.members.joined.iter().find(|m| m.user_address == alice.address()).unwrap();
        let receiver = snapshot.members.joined.iter().find(|m| m.user_address == bob.address()).unwrap();
        assert_eq!(sender.tips_sent.get("eth"), Some(&14));
        assert_eq!(receiver.tips_received_count.get("eth"), Some(&2));
    }

    #[test]
    fn user_streams_fold() {
        let wallet = Wallet::generate();

        // 1. Encryption devices are deduplicated and capped.
        let metadata_id = StreamId::for_user(StreamType::UserMetadata, &wallet.address());
        let inception = event(
            &wallet,
            Payload::UserMetadata(UserMetadataPayload::Inception(UserMetadataInception {
                stream_id: metadata_id,
                settings: StreamSettings::default(),
            })),
        );
        let mut snapshot = make_genesis_snapshot(&[inception]).unwrap();
        for i in 0..(MAX_ENCRYPTION_DEVICES + 3) {
            let device = event(
                &wallet,
                Payload::UserMetadata(UserMetadataPayload::EncryptionDevice {
                    device_key: format!("device{}", i),
                    fallback_key: "fallback".to_string(),
                }),
            );
            update_snapshot(&mut snapshot, &device, 1, i as i64).unwrap();
        }
        let again = event(
            &wallet,
            Payload::UserMetadata(UserMetadataPayload::EncryptionDevice {
                device_key: "device5".to_string(),
                fallback_key: "fallback".to_string(),
            }),
        );
        update_snapshot(&mut snapshot, &again, 1, 20).unwrap();
        if let SnapshotContent::UserMetadata(metadata) = &snapshot.content {
            assert_eq!(metadata.encryption_devices.len(), MAX_ENCRYPTION_DEVICES);
            assert_eq!(metadata.encryption_devices.last().unwrap().device_key, "device5");
            assert_eq!(metadata.encryption_devices[0].device_key, "device3");
        } else {
            panic!("expected a user metadata snapshot");
        }

        // 2. Inbox summaries track the miniblocks holding sessions, and acks trim them.
        let inbox_id = StreamId::for_user(StreamType::UserInbox, &wallet.address());
        let inception = event(
            &wallet,
            Payload::UserInbox(UserInboxPayload::Inception(UserInboxInception {
                stream_id: inbox_id,
                settings: StreamSettings::default(),
            })),
        );
        let mut snapshot = make_genesis_snapshot(&[inception]).unwrap();
        let sessions = event(
            &wallet,
            Payload::UserInbox(UserInboxPayload::GroupEncryptionSessions(GroupEncryptionSessions {
                stream_id: StreamId::random(StreamType::Channel),
                sender_key: "sender".to_string(),
                session_ids: vec!["s".to_string()],
                ciphertexts: BTreeMap::from([("a".to_string(), "x".to_string()), ("b".to_string(), "y".to_string())]),
            })),
        );
        update_snapshot(&mut snapshot, &sessions, 5, 1).unwrap();
        update_snapshot(&mut snapshot, &sessions, 8, 2).unwrap();
        let ack = event(&wallet, Payload::UserInbox(UserInboxPayload::Ack { device_key: "a".to_string(), miniblock_num: 6 }));
        update_snapshot(&mut snapshot, &ack, 9, 3).unwrap();
        let ack = event(&wallet, Payload::UserInbox(UserInboxPayload::Ack { device_key: "b".to_string(), miniblock_num: 8 }));
        update_snapshot(&mut snapshot, &ack, 9, 4).unwrap();
        if let SnapshotContent::UserInbox(inbox) = &snapshot.content {
            assert_eq!(inbox.device_summary.get("a"), Some(&DeviceSummary { lower_bound: 7, upper_bound: 8 }));
            assert!(!inbox.device_summary.contains_key("b"));
        } else {
            panic!("expected a user inbox snapshot");
        }

        // 3. Summaries far behind the current miniblock are dropped.
        update_snapshot(&mut snapshot, &sessions, 8 + MAX_DEVICE_SUMMARY_GAP, 5).unwrap();
        if let SnapshotContent::UserInbox(inbox) = &snapshot.content {
            assert!(!inbox.device_summary.contains_key("a"));
        }
    }

    #[test]
    fn folded_snapshot_survives_serialization() {
        let creator = Wallet::generate();
        let (_, events) = space_genesis(&creator);
        let mut snapshot = make_genesis_snapshot(&events).unwrap();

        // 1. Members join in an order unrelated to their addresses, and one of them solicits keys on more
        // devices than are kept.
        let mut members: Vec<Wallet> = (0..5).map(|_| Wallet::generate()).collect();
        members.sort_by_key(|member| std::cmp::Reverse(member.address()));
        let mut event_num = 2;
        for member in &members {
            update_snapshot(&mut snapshot, &join(&creator, member.address()), 1, event_num).unwrap();
            event_num += 1;
        }
        for i in 0..(MAX_SOLICITATIONS + 3) {
            let solicitation = event(
                &members[0],
                Payload::Member(MemberPayload::KeySolicitation(KeySolicitation {
                    device_key: format!("device{}", i),
                    fallback_key: "fallback".to_string(),
                    is_new_device: false,
                    session_ids: vec!["s".to_string()],
                })),
            );
            update_snapshot(&mut snapshot, &solicitation, 2, event_num).unwrap();
            event_num += 1;
        }

        // 2. Members are sorted by address and solicitations are bounded.
        let check = |snapshot: &Snapshot| {
            let joined = &snapshot.members.joined;
            assert_eq!(joined.len(), members.len() + 1);
            assert!(joined.windows(2).all(|pair| pair[0].user_address < pair[1].user_address));
            assert!(joined.iter().all(|member| member.solicitations.len() <= MAX_SOLICITATIONS));
            let soliciting = joined.iter().find(|member| member.user_address == members[0].address()).unwrap();
            assert_eq!(soliciting.solicitations.len(), MAX_SOLICITATIONS);
            assert_eq!(soliciting.solicitations[0].device_key, "device3");
        };
        check(&snapshot);

        // 3. The folded snapshot decodes to the same value, directly and through a signed envelope.
        let bytes = snapshot.try_to_vec().unwrap();
        let decoded = Snapshot::try_from_slice(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
        check(&decoded);

        let envelope = make_snapshot_envelope(&creator, &snapshot).unwrap();
        assert_eq!(parse_snapshot(&envelope, &creator.address()).unwrap(), snapshot);
    }

    #[test]
    fn snapshot_envelope_round_trip_and_genesis_miniblock() {
        let wallet = Wallet::generate();
        let (_, events) = space_genesis(&wallet);

        let genesis = make_genesis_miniblock(&wallet, events.clone(), true).unwrap();
        assert_eq!(genesis.num(), 0);
        assert!(genesis.header().snapshot.is_none());
        let envelope = genesis.snapshot_envelope.clone().unwrap();
        assert_eq!(genesis.header().snapshot_hash, Some(envelope.hash));

        // Reparsing validates the detached snapshot.
        let reparsed = MiniblockInfo::new(genesis.miniblock.clone(), Some(envelope.clone()), &MiniblockInfoOpts::new()).unwrap();
        assert_eq!(reparsed.snapshot().map(|s| s.as_ref()), genesis.snapshot().map(|s| s.as_ref()));

        // A snapshot signed by someone else is rejected.
        let other = Wallet::generate();
        assert!(matches!(parse_snapshot(&envelope, &other.address()), Err(StreamError::BadEventSignature { .. })));

        let legacy = make_genesis_miniblock(&wallet, events, false).unwrap();
        assert!(legacy.header().snapshot.is_some());
        assert!(legacy.snapshot_envelope.is_none());
    }
}
