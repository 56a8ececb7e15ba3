/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One attempt at producing the next miniblock of a stream.
//!
//! For a replicated stream the job asks every other quorum node for its proposal, pulls in the events it
//! is missing, and keeps the events that a quorum of nodes (itself included) has. The candidate built from
//! them is saved on the quorum nodes, and pushed to the sync nodes without waiting for them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::StreamConfig;
use crate::context::Context;
use crate::errors::{ErrorCode, StreamError};
use crate::events::{Event, ProduceCandidateEvent, SkipCandidateEvent};
use crate::networking::{MiniblockWithSnapshot, ProposeMiniblockRequest, ProposeMiniblockResponse};
use crate::quorum_pool::{total_quorum_num, QuorumMode, QuorumPool};
use crate::stream::minipool::Minipool;
use crate::stream::{MbProposal, Stream, StreamView};
use crate::stream_cache::StreamCache;
use crate::types::data_types::{Address, BlockNumber, CryptoHash};
use crate::types::envelope::ParsedEvent;
use crate::types::miniblock::MiniblockInfo;

use super::skip_candidate;

const SAVE_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(240);

pub(crate) struct MbJob {
    cache: Arc<StreamCache>,
    stream: Arc<Stream>,
    block_num: BlockNumber,
    force_snapshot: bool,
    quorum_nodes: Vec<Address>,
    remote_quorum_nodes: Vec<Address>,
    sync_nodes: Vec<Address>,
}

impl MbJob {
    pub(crate) fn new(cache: Arc<StreamCache>, stream: Arc<Stream>, block_num: BlockNumber, force_snapshot: bool) -> MbJob {
        let local = cache.local_address();
        let quorum_nodes = stream.get_quorum_nodes();
        let remote_quorum_nodes = quorum_nodes.iter().filter(|node| **node != local).copied().collect();
        let sync_nodes = stream.get_sync_nodes();
        MbJob { cache, stream, block_num, force_snapshot, quorum_nodes, remote_quorum_nodes, sync_nodes }
    }

    pub(crate) fn is_replicated(&self) -> bool {
        self.quorum_nodes.len() > 1
    }

    /// Produce a candidate and save it on the quorum. `None` if there was nothing to seal.
    pub(crate) fn run(&self, ctx: &Context) -> Result<Option<Arc<MiniblockInfo>>, StreamError> {
        self.should_continue(ctx)?;
        let candidate = match self.produce_candidate(ctx)? {
            Some(candidate) => Arc::new(candidate),
            None => return Ok(None),
        };
        self.save_candidate(ctx, &candidate)?;
        Ok(Some(candidate))
    }

    /// Fails with `ResourceExhausted` if the throttle says to skip this block.
    fn should_continue(&self, ctx: &Context) -> Result<(), StreamError> {
        if self.block_num.int() == 0 {
            return Ok(());
        }
        let view = self.stream.get_view(ctx)?;
        let candidate_count = self
            .cache
            .params
            .storage
            .get_miniblock_candidate_count(self.stream.stream_id(), view.generation())?;
        if skip_candidate(candidate_count, self.block_num) {
            Event::publish(
                &self.cache.params.event_publisher,
                Event::SkipCandidate(SkipCandidateEvent {
                    timestamp: SystemTime::now(),
                    stream_id: self.stream.stream_id().clone(),
                    block_num: self.block_num,
                    candidate_count,
                }),
            );
            return Err(StreamError::ResourceExhausted {
                reason: format!(
                    "{} candidates already stored for miniblock {} of {}",
                    candidate_count,
                    view.generation(),
                    self.stream.stream_id()
                ),
            });
        }
        Ok(())
    }

    fn produce_candidate(&self, ctx: &Context) -> Result<Option<MiniblockInfo>, StreamError> {
        let local = self.cache.local_address();
        if !self.quorum_nodes.contains(&local) {
            return Err(StreamError::internal(format!(
                "{} is not in the quorum of {}",
                local,
                self.stream.stream_id()
            )));
        }
        let config = self.cache.stream_config();
        let view = self.stream.get_view(ctx)?;

        let (proposal, proposals) = if self.is_replicated() {
            let mut proposals = match self.gather_remote_proposals(ctx, &view) {
                Ok(proposals) => proposals,
                Err(err) => {
                    if err.has_code(ErrorCode::MiniblockTooOld) {
                        self.cache.submit_reconcile_stream_task(self.stream.clone(), None);
                    }
                    return Err(err);
                }
            };
            let view = self.stream.get_view(ctx)?;
            proposals.push(view.local_proposal(config, self.force_snapshot));
            let count = proposals.len();
            (combine_proposals(&proposals, total_quorum_num(self.quorum_nodes.len()), view.minipool(), config)?, count)
        } else {
            let proposal = view.local_proposal(config, self.force_snapshot);
            let proposal = if proposal.event_hashes.is_empty() && !proposal.should_snapshot { None } else { Some(proposal) };
            (proposal, 1)
        };
        let proposal = match proposal {
            Some(proposal) => proposal,
            None => return Ok(None),
        };

        let view = self.stream.get_view(ctx)?;
        let candidate = view.make_miniblock_candidate(&self.cache.params.wallet, &proposal, config)?;
        Event::publish(
            &self.cache.params.event_publisher,
            Event::ProduceCandidate(ProduceCandidateEvent {
                timestamp: SystemTime::now(),
                stream_id: self.stream.stream_id().clone(),
                candidate: candidate.miniblock_ref,
                events: candidate.events().len(),
                proposals,
            }),
        );
        Ok(Some(candidate))
    }

    /// Ask the other quorum nodes for their proposals, add the events they have and this node lacks, and
    /// return their proposals restricted to events this node has.
    fn gather_remote_proposals(&self, ctx: &Context, view: &StreamView) -> Result<Vec<MbProposal>, StreamError> {
        let request = ProposeMiniblockRequest {
            stream_id: self.stream.stream_id().clone(),
            new_miniblock_num: view.generation(),
            prev_miniblock_hash: view.last_block().hash(),
            local_event_hashes: view.minipool().hashes(),
            force_snapshot: self.force_snapshot,
        };
        let responses: Arc<Mutex<Vec<ProposeMiniblockResponse>>> = Arc::new(Mutex::new(Vec::new()));

        let gather_ctx = ctx.child_with_timeout(self.cache.settings.block_time * 2);
        let mut pool = QuorumPool::new("gather_proposals", &gather_ctx, QuorumMode::Read)
            .with_extra_wait(2.0, Duration::from_millis(100))
            .with_event_publisher(self.cache.params.event_publisher.clone());
        pool.add_local_success();
        let remotes = self.cache.remotes.clone();
        let collected = responses.clone();
        let task_request = request.clone();
        pool.add_node_tasks(&self.remote_quorum_nodes, move |ctx, node| {
            let response = remotes.get_mb_proposal(ctx, &node, task_request.clone())?;
            if response.proposal.new_miniblock_num != task_request.new_miniblock_num
                || response.proposal.prev_miniblock_hash != task_request.prev_miniblock_hash
            {
                return Err(StreamError::MiniblockTooOld {
                    stream_id: task_request.stream_id.clone(),
                    requested: task_request.new_miniblock_num,
                    local: response.proposal.new_miniblock_num,
                });
            }
            collected.lock().unwrap().push(response);
            Ok(())
        });
        pool.wait()?;
        let responses = std::mem::take(&mut *responses.lock().unwrap());

        self.check_generation(ctx, request.new_miniblock_num)?;
        let mut added = HashSet::new();
        for response in &responses {
            for envelope in &response.missing_events {
                if !added.insert(envelope.hash) {
                    continue;
                }
                match ParsedEvent::parse(envelope.clone()) {
                    Ok(event) => {
                        if let Err(err) = self.stream.add_event(ctx, event) {
                            log::warn!("{}: failed to add event {} from a proposal: {}", self.stream.stream_id(), envelope.hash, err);
                        }
                    }
                    Err(err) => log::warn!("{}: bad event {} in a proposal: {}", self.stream.stream_id(), envelope.hash, err),
                }
            }
        }
        let view = self.check_generation(ctx, request.new_miniblock_num)?;

        Ok(responses
            .into_iter()
            .map(|response| {
                let mut proposal = response.proposal;
                proposal.event_hashes.retain(|hash| view.minipool().contains(hash));
                proposal
            })
            .collect())
    }

    fn check_generation(&self, ctx: &Context, generation: i64) -> Result<Arc<StreamView>, StreamError> {
        let view = self.stream.get_view(ctx)?;
        if view.generation() != generation {
            return Err(StreamError::MiniblockTooOld {
                stream_id: self.stream.stream_id().clone(),
                requested: generation,
                local: view.generation(),
            });
        }
        Ok(view)
    }

    /// Store the candidate on every quorum node, this one included, and wait for a majority. Sync nodes
    /// get it too, but are not waited for.
    fn save_candidate(&self, ctx: &Context, candidate: &Arc<MiniblockInfo>) -> Result<(), StreamError> {
        let wire = MiniblockWithSnapshot::from_info(candidate);

        let mut pool = QuorumPool::new("save_candidate", ctx, QuorumMode::Write { timeout: SAVE_CANDIDATE_TIMEOUT })
            .with_task_group(self.cache.write_tasks.clone())
            .with_event_publisher(self.cache.params.event_publisher.clone());
        let stream = self.stream.clone();
        let local_candidate = candidate.clone();
        pool.add_task(move |ctx| stream.save_miniblock_candidate(ctx, local_candidate));
        self.add_save_tasks(&mut pool, &self.remote_quorum_nodes, &wire);

        if !self.sync_nodes.is_empty() {
            let mut sync_pool = QuorumPool::new("save_candidate_sync", ctx, QuorumMode::Write { timeout: SAVE_CANDIDATE_TIMEOUT })
                .with_task_group(self.cache.write_tasks.clone())
                .with_quorum_num(0);
            self.add_save_tasks(&mut sync_pool, &self.sync_nodes, &wire);
            sync_pool.wait()?;
        }
        pool.wait()
    }

    fn add_save_tasks(&self, pool: &mut QuorumPool, nodes: &[Address], candidate: &MiniblockWithSnapshot) {
        let remotes = self.cache.remotes.clone();
        let stream_id = self.stream.stream_id().clone();
        let candidate = candidate.clone();
        pool.add_node_tasks(nodes, move |ctx, node| remotes.save_mb_candidate(ctx, &node, &stream_id, candidate.clone()));
    }
}

/// Merge proposals for the same miniblock into one. An event is included if at least `quorum_num`
/// proposals contain it, in local minipool order and within the miniblock limits. A snapshot is taken if
/// at least `quorum_num` proposals ask for one. `None` if the result would be empty.
pub(crate) fn combine_proposals(
    proposals: &[MbProposal],
    quorum_num: usize,
    minipool: &Minipool,
    config: &StreamConfig,
) -> Result<Option<MbProposal>, StreamError> {
    let first = match proposals.first() {
        Some(first) => first,
        None => return Err(StreamError::internal("no proposals to combine")),
    };
    if proposals.len() < quorum_num {
        return Err(StreamError::internal(format!(
            "{} proposals are fewer than the quorum of {}",
            proposals.len(),
            quorum_num
        )));
    }
    for proposal in &proposals[1..] {
        if proposal.new_miniblock_num != first.new_miniblock_num || proposal.prev_miniblock_hash != first.prev_miniblock_hash {
            return Err(StreamError::internal(format!(
                "proposals disagree on the next miniblock: {} after {} and {} after {}",
                first.new_miniblock_num, first.prev_miniblock_hash, proposal.new_miniblock_num, proposal.prev_miniblock_hash
            )));
        }
    }

    let mut votes: HashMap<CryptoHash, usize> = HashMap::new();
    for proposal in proposals {
        let unique: HashSet<&CryptoHash> = proposal.event_hashes.iter().collect();
        for hash in unique {
            *votes.entry(*hash).or_default() += 1;
        }
    }

    let (max_events, max_size) = config.miniblock_event_limits();
    let mut event_hashes = Vec::new();
    let mut total_size = 0usize;
    for event in minipool.events() {
        if votes.get(&event.hash).copied().unwrap_or(0) < quorum_num {
            continue;
        }
        if event_hashes.len() >= max_events {
            break;
        }
        let size = event.size();
        if !event_hashes.is_empty() && total_size.saturating_add(size) > max_size {
            break;
        }
        total_size = total_size.saturating_add(size);
        event_hashes.push(event.hash);
    }

    let snapshot_votes = proposals.iter().filter(|proposal| proposal.should_snapshot).count();
    let should_snapshot = snapshot_votes >= quorum_num;
    if event_hashes.is_empty() && !should_snapshot {
        return Ok(None);
    }
    Ok(Some(MbProposal {
        new_miniblock_num: first.new_miniblock_num,
        prev_miniblock_hash: first.prev_miniblock_hash,
        event_hashes,
        should_snapshot,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel_genesis, message_event};
    use crate::types::crypto_primitives::Wallet;
    use crate::types::payloads::StreamSettings;

    fn view_with_messages(count: usize) -> StreamView {
        let wallet = Wallet::generate();
        let genesis = Arc::new(channel_genesis(&wallet, StreamSettings::default()));
        let mut view = StreamView::from_genesis(genesis.clone()).unwrap();
        for i in 0..count {
            let event = message_event(&wallet, &genesis, &format!("message {}", i));
            view = view.copy_and_add_event(Arc::new(event)).unwrap();
        }
        view
    }

    fn proposal(view: &StreamView, indices: &[usize], should_snapshot: bool) -> MbProposal {
        let hashes = view.minipool().hashes();
        MbProposal {
            new_miniblock_num: view.generation(),
            prev_miniblock_hash: view.last_block().hash(),
            event_hashes: indices.iter().map(|i| hashes[*i]).collect(),
            should_snapshot,
        }
    }

    #[test]
    fn combine_keeps_events_a_quorum_has() {
        let view = view_with_messages(4);
        let hashes = view.minipool().hashes();
        let proposals = vec![
            proposal(&view, &[0, 1, 2], false),
            proposal(&view, &[1, 2, 3], false),
            proposal(&view, &[2, 1], true),
        ];

        let combined = combine_proposals(&proposals, 2, view.minipool(), &StreamConfig::default()).unwrap().unwrap();
        // Minipool order, not proposal order.
        assert_eq!(combined.event_hashes, vec![hashes[1], hashes[2]]);
        assert!(!combined.should_snapshot);

        let combined = combine_proposals(&proposals, 3, view.minipool(), &StreamConfig::default()).unwrap().unwrap();
        assert_eq!(combined.event_hashes, vec![hashes[1], hashes[2]]);
    }

    #[test]
    fn combine_respects_limits_and_snapshot_votes() {
        let view = view_with_messages(5);
        let all = [0, 1, 2, 3, 4];
        let proposals = vec![proposal(&view, &all, true), proposal(&view, &all, true), proposal(&view, &all, false)];
        let config = StreamConfig::builder().max_events_per_miniblock(3).build();

        let combined = combine_proposals(&proposals, 2, view.minipool(), &config).unwrap().unwrap();
        assert_eq!(combined.event_hashes.len(), 3);
        assert!(combined.should_snapshot);
    }

    #[test]
    fn combine_nothing_agreed_is_none() {
        let view = view_with_messages(2);
        let proposals = vec![proposal(&view, &[0], false), proposal(&view, &[1], false), proposal(&view, &[], false)];
        assert!(combine_proposals(&proposals, 2, view.minipool(), &StreamConfig::default()).unwrap().is_none());
    }

    #[test]
    fn combine_rejects_disagreement_and_short_quorum() {
        let view = view_with_messages(1);
        let mut other = proposal(&view, &[0], false);
        other.new_miniblock_num += 1;
        let proposals = vec![proposal(&view, &[0], false), other];
        assert_eq!(
            combine_proposals(&proposals, 2, view.minipool(), &StreamConfig::default()).unwrap_err().code(),
            ErrorCode::Internal
        );

        let proposals = vec![proposal(&view, &[0], false)];
        assert!(combine_proposals(&proposals, 2, view.minipool(), &StreamConfig::default()).is_err());
        assert!(combine_proposals(&[], 1, view.minipool(), &StreamConfig::default()).is_err());
    }
}
