/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Folding of the four per-user streams: user, user settings, user metadata, and user inbox.

use std::collections::BTreeMap;

use crate::errors::StreamError;
use crate::types::envelope::ParsedEvent;
use crate::types::payloads::{
    TransactionContent, UserInboxPayload, UserMetadataPayload, UserPayload, UserSettingsPayload,
};
use crate::types::snapshot::{
    DeviceSummary, FullyReadMarkers, Snapshot, SnapshotContent, UserBlock, UserBlockList, UserDevice,
    UserMembershipEntry, WrappedEncryptedData,
};

use super::sorted::{find_sorted, insert_sorted};
use super::wrong_content;

/// Number of encryption devices a user metadata snapshot retains.
pub(crate) const MAX_ENCRYPTION_DEVICES: usize = 10;

/// Inbox device summaries whose lower bound is this many miniblocks behind are dropped.
pub(crate) const MAX_DEVICE_SUMMARY_GAP: i64 = 3600;

pub(super) fn update_user(snapshot: &mut Snapshot, payload: &UserPayload) -> Result<(), StreamError> {
    let user = match &mut snapshot.content {
        SnapshotContent::User(user) => user,
        _ => return Err(wrong_content("user")),
    };
    match payload {
        UserPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        UserPayload::UserMembership(membership) => {
            insert_sorted(
                &mut user.memberships,
                UserMembershipEntry {
                    stream_id: membership.stream_id.clone(),
                    op: membership.op,
                    inviter: membership.inviter,
                },
                |entry| &entry.stream_id,
            );
            Ok(())
        }
        UserPayload::UserMembershipAction { .. } => Ok(()),
        UserPayload::BlockchainTransaction(transaction) => {
            if let TransactionContent::Tip(tip) = &transaction.content {
                add_tip(&mut user.tips_sent, &mut user.tips_sent_count, &tip.currency, tip.amount);
            }
            Ok(())
        }
        UserPayload::ReceivedBlockchainTransaction(transaction) => {
            if let TransactionContent::Tip(tip) = &transaction.content {
                add_tip(&mut user.tips_received, &mut user.tips_received_count, &tip.currency, tip.amount);
            }
            Ok(())
        }
    }
}

pub(super) fn add_tip(
    totals: &mut BTreeMap<String, u64>,
    counts: &mut BTreeMap<String, u64>,
    currency: &str,
    amount: u64,
) {
    let total = totals.entry(currency.to_string()).or_insert(0);
    *total = total.saturating_add(amount);
    *counts.entry(currency.to_string()).or_insert(0) += 1;
}

pub(super) fn update_user_settings(
    snapshot: &mut Snapshot,
    payload: &UserSettingsPayload,
    event_num: i64,
) -> Result<(), StreamError> {
    let settings = match &mut snapshot.content {
        SnapshotContent::UserSettings(settings) => settings,
        _ => return Err(wrong_content("user settings")),
    };
    match payload {
        UserSettingsPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        UserSettingsPayload::FullyReadMarkers { stream_id, content } => {
            insert_sorted(
                &mut settings.fully_read_markers,
                FullyReadMarkers { stream_id: stream_id.clone(), content: content.clone() },
                |markers| &markers.stream_id,
            );
            Ok(())
        }
        UserSettingsPayload::UserBlockingAction { user, is_blocked } => {
            let block = UserBlock { is_blocked: *is_blocked, event_num };
            match find_sorted(&settings.user_block_lists, user, |list| &list.user) {
                Some(i) => settings.user_block_lists[i].blocks.push(block),
                None => insert_sorted(
                    &mut settings.user_block_lists,
                    UserBlockList { user: *user, blocks: vec![block] },
                    |list| &list.user,
                ),
            }
            Ok(())
        }
    }
}

pub(super) fn update_user_metadata(
    snapshot: &mut Snapshot,
    payload: &UserMetadataPayload,
    event: &ParsedEvent,
    event_num: i64,
) -> Result<(), StreamError> {
    let metadata = match &mut snapshot.content {
        SnapshotContent::UserMetadata(metadata) => metadata,
        _ => return Err(wrong_content("user metadata")),
    };
    match payload {
        UserMetadataPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        UserMetadataPayload::EncryptionDevice { device_key, fallback_key } => {
            metadata.encryption_devices.retain(|device| device.device_key != *device_key);
            metadata
                .encryption_devices
                .push(UserDevice { device_key: device_key.clone(), fallback_key: fallback_key.clone() });
            if metadata.encryption_devices.len() > MAX_ENCRYPTION_DEVICES {
                let excess = metadata.encryption_devices.len() - MAX_ENCRYPTION_DEVICES;
                metadata.encryption_devices.drain(..excess);
            }
            Ok(())
        }
        UserMetadataPayload::ProfileImage(data) => {
            metadata.profile_image = Some(WrappedEncryptedData { data: data.clone(), event_num, event_hash: event.hash });
            Ok(())
        }
        UserMetadataPayload::Bio(data) => {
            metadata.bio = Some(WrappedEncryptedData { data: data.clone(), event_num, event_hash: event.hash });
            Ok(())
        }
    }
}

pub(super) fn update_user_inbox(
    snapshot: &mut Snapshot,
    payload: &UserInboxPayload,
    miniblock_num: i64,
) -> Result<(), StreamError> {
    let inbox = match &mut snapshot.content {
        SnapshotContent::UserInbox(inbox) => inbox,
        _ => return Err(wrong_content("user inbox")),
    };
    match payload {
        UserInboxPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        UserInboxPayload::GroupEncryptionSessions(sessions) => {
            for device_key in sessions.ciphertexts.keys() {
                inbox
                    .device_summary
                    .entry(device_key.clone())
                    .and_modify(|summary| summary.upper_bound = miniblock_num)
                    .or_insert(DeviceSummary { lower_bound: miniblock_num, upper_bound: miniblock_num });
            }
            cleanup_device_summary(&mut inbox.device_summary, miniblock_num);
            Ok(())
        }
        UserInboxPayload::Ack { device_key, miniblock_num: acked } => {
            if let Some(summary) = inbox.device_summary.get_mut(device_key) {
                if summary.upper_bound <= *acked {
                    inbox.device_summary.remove(device_key);
                } else {
                    summary.lower_bound = acked + 1;
                }
            }
            cleanup_device_summary(&mut inbox.device_summary, miniblock_num);
            Ok(())
        }
    }
}

fn cleanup_device_summary(summaries: &mut BTreeMap<String, DeviceSummary>, current: i64) {
    summaries.retain(|_, summary| current - summary.lower_bound <= MAX_DEVICE_SUMMARY_GAP);
}
