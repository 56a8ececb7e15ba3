/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Folding of space, channel, DM, and GDM payloads.

use crate::errors::StreamError;
use crate::types::envelope::ParsedEvent;
use crate::types::payloads::{ChannelOp, ChannelPayload, ChannelSettings, DmChannelPayload, GdmChannelPayload, SpacePayload};
use crate::types::snapshot::{ChannelMetadata, SnappedSpaceImage, Snapshot, SnapshotContent, WrappedEncryptedData};

use super::sorted::{find_sorted, insert_sorted};
use super::wrong_content;

pub(super) fn update_space(
    snapshot: &mut Snapshot,
    payload: &SpacePayload,
    event: &ParsedEvent,
    event_num: i64,
) -> Result<(), StreamError> {
    let space = match &mut snapshot.content {
        SnapshotContent::Space(space) => space,
        _ => return Err(wrong_content("space")),
    };

    match payload {
        SpacePayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        SpacePayload::Channel(update) => {
            let settings = match &update.settings {
                Some(settings) => settings.clone(),
                None if update.op == ChannelOp::Created => ChannelSettings {
                    autojoin: update.channel_id.is_default_channel_of(&space.inception.stream_id),
                    hide_user_join_leave_events: false,
                },
                None => {
                    let i = find_sorted(&space.channels, &update.channel_id, |channel| &channel.channel_id)
                        .ok_or_else(|| StreamError::not_found(format!("channel {} in space", update.channel_id)))?;
                    space.channels[i].settings.clone()
                }
            };
            insert_sorted(
                &mut space.channels,
                ChannelMetadata {
                    channel_id: update.channel_id.clone(),
                    operation: update.op,
                    origin_event: update.origin_event,
                    updated_at_event_num: event_num,
                    settings,
                },
                |channel| &channel.channel_id,
            );
            Ok(())
        }
        SpacePayload::UpdateChannelAutojoin { channel_id, autojoin } => {
            let i = find_sorted(&space.channels, channel_id, |channel| &channel.channel_id)
                .ok_or_else(|| StreamError::not_found(format!("channel {} in space", channel_id)))?;
            space.channels[i].settings.autojoin = *autojoin;
            Ok(())
        }
        SpacePayload::UpdateChannelHideUserJoinLeaveEvents { channel_id, hide_user_join_leave_events } => {
            let i = find_sorted(&space.channels, channel_id, |channel| &channel.channel_id)
                .ok_or_else(|| StreamError::not_found(format!("channel {} in space", channel_id)))?;
            space.channels[i].settings.hide_user_join_leave_events = *hide_user_join_leave_events;
            Ok(())
        }
        SpacePayload::SpaceImage(data) => {
            space.space_image = Some(SnappedSpaceImage {
                data: data.clone(),
                creator: *event.creator(),
                event_num,
                event_hash: event.hash,
            });
            Ok(())
        }
    }
}

pub(super) fn update_channel(snapshot: &Snapshot, payload: &ChannelPayload) -> Result<(), StreamError> {
    if !matches!(snapshot.content, SnapshotContent::Channel(_)) {
        return Err(wrong_content("channel"));
    }
    match payload {
        ChannelPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        ChannelPayload::Message(_) | ChannelPayload::Redaction { .. } => Ok(()),
    }
}

pub(super) fn update_dm_channel(snapshot: &Snapshot, payload: &DmChannelPayload) -> Result<(), StreamError> {
    if !matches!(snapshot.content, SnapshotContent::DmChannel(_)) {
        return Err(wrong_content("dm channel"));
    }
    match payload {
        DmChannelPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        DmChannelPayload::Message(_) => Ok(()),
    }
}

pub(super) fn update_gdm_channel(
    snapshot: &mut Snapshot,
    payload: &GdmChannelPayload,
    event: &ParsedEvent,
    event_num: i64,
) -> Result<(), StreamError> {
    let gdm = match &mut snapshot.content {
        SnapshotContent::GdmChannel(gdm) => gdm,
        _ => return Err(wrong_content("gdm channel")),
    };
    match payload {
        GdmChannelPayload::Inception(_) => Err(StreamError::invalid_argument("cannot update snapshot with inception event")),
        GdmChannelPayload::Message(_) => Ok(()),
        GdmChannelPayload::ChannelProperties(data) => {
            gdm.channel_properties = Some(WrappedEncryptedData { data: data.clone(), event_num, event_hash: event.hash });
            Ok(())
        }
    }
}
