/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Folding of member payloads. These apply to every stream type.

use crate::errors::StreamError;
use crate::types::data_types::Address;
use crate::types::envelope::ParsedEvent;
use crate::types::payloads::{MemberPayload, MembershipOp, TransactionContent};
use crate::types::snapshot::{Member, MemberSolicitation, Members, SnappedPin, WrappedEncryptedData};

use super::sorted::{find_sorted, insert_sorted, remove_common, remove_sorted};
use super::user::add_tip;

/// Number of key solicitations retained per member.
pub(crate) const MAX_SOLICITATIONS: usize = 10;

pub(super) fn update_members(
    members: &mut Members,
    payload: &MemberPayload,
    event: &ParsedEvent,
    miniblock_num: i64,
    event_num: i64,
) -> Result<(), StreamError> {
    match payload {
        MemberPayload::Membership(membership) => match membership.op {
            MembershipOp::Join => {
                insert_sorted(
                    &mut members.joined,
                    Member {
                        user_address: membership.user,
                        miniblock_num,
                        event_num,
                        app_address: membership.app_address,
                        sponsor: membership.sponsor,
                        ..Default::default()
                    },
                    |member| &member.user_address,
                );
                Ok(())
            }
            MembershipOp::Leave => {
                remove_sorted(&mut members.joined, &membership.user, |member| &member.user_address);
                Ok(())
            }
            MembershipOp::Invite => Ok(()),
            MembershipOp::Unspecified => Err(StreamError::invalid_argument("unknown membership op")),
        },
        MemberPayload::KeySolicitation(solicitation) => {
            let member = find_member(members, event.creator())?;
            member.solicitations.retain(|existing| existing.device_key != solicitation.device_key);
            let mut session_ids = solicitation.session_ids.clone();
            session_ids.sort();
            member.solicitations.push(MemberSolicitation {
                device_key: solicitation.device_key.clone(),
                fallback_key: solicitation.fallback_key.clone(),
                is_new_device: solicitation.is_new_device,
                session_ids,
            });
            if member.solicitations.len() > MAX_SOLICITATIONS {
                let excess = member.solicitations.len() - MAX_SOLICITATIONS;
                member.solicitations.drain(..excess);
            }
            Ok(())
        }
        MemberPayload::KeyFulfillment { user, device_key, session_ids } => {
            let member = find_member(members, user)?;
            if let Some(i) = member.solicitations.iter().position(|s| s.device_key == *device_key) {
                let mut fulfilled = session_ids.clone();
                fulfilled.sort();
                let solicitation = &mut member.solicitations[i];
                remove_common(&mut solicitation.session_ids, &fulfilled);
                solicitation.is_new_device = false;
                if solicitation.session_ids.is_empty() {
                    member.solicitations.remove(i);
                }
            }
            Ok(())
        }
        MemberPayload::DisplayName(data) => {
            let member = find_member(members, event.creator())?;
            member.display_name = Some(WrappedEncryptedData { data: data.clone(), event_num, event_hash: event.hash });
            Ok(())
        }
        MemberPayload::Username(data) => {
            let member = find_member(members, event.creator())?;
            member.username = Some(WrappedEncryptedData { data: data.clone(), event_num, event_hash: event.hash });
            Ok(())
        }
        MemberPayload::EnsAddress(address) => {
            find_member(members, event.creator())?.ens_address = address.clone();
            Ok(())
        }
        MemberPayload::Nft(nft) => {
            find_member(members, event.creator())?.nft = Some(nft.clone());
            Ok(())
        }
        MemberPayload::Pin { event_id, event: pinned } => {
            members.pins.push(SnappedPin { event_id: *event_id, event: pinned.clone(), creator: *event.creator() });
            Ok(())
        }
        MemberPayload::Unpin { event_id } => {
            members.pins.retain(|pin| pin.event_id != *event_id);
            Ok(())
        }
        MemberPayload::EncryptionAlgorithm { algorithm } => {
            members.encryption_algorithm = algorithm.clone();
            Ok(())
        }
        MemberPayload::MemberBlockchainTransaction { from_user, transaction } => {
            if let TransactionContent::Tip(tip) = &transaction.content {
                add_tip(&mut members.tips, &mut members.tips_count, &tip.currency, tip.amount);
                let sender = find_member(members, from_user)?;
                add_tip(&mut sender.tips_sent, &mut sender.tips_sent_count, &tip.currency, tip.amount);
                let receiver = find_member(members, &tip.receiver)?;
                add_tip(&mut receiver.tips_received, &mut receiver.tips_received_count, &tip.currency, tip.amount);
            }
            Ok(())
        }
    }
}

fn find_member<'a>(members: &'a mut Members, user: &Address) -> Result<&'a mut Member, StreamError> {
    let i = find_sorted(&members.joined, user, |member| &member.user_address)
        .ok_or_else(|| StreamError::not_found(format!("member {}", user)))?;
    Ok(&mut members.joined[i])
}
