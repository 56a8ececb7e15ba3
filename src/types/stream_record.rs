/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Registry records and the node placement of a stream.

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{Address, CryptoHash, MiniblockRef, StreamId};

/// What the external registry knows about a stream.
///
/// The first `replication_factor` entries of `nodes` form the stream's quorum. The remaining nodes are
/// sync-only: they receive candidates and reconcile the stream, but do not vote.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct StreamRecord {
    pub stream_id: StreamId,
    pub last_miniblock_hash: CryptoHash,
    pub last_miniblock_num: i64,
    pub is_sealed: bool,
    pub nodes: Vec<Address>,
    pub replication_factor: usize,
}

impl StreamRecord {
    pub fn last_miniblock(&self) -> MiniblockRef {
        MiniblockRef::new(self.last_miniblock_hash, self.last_miniblock_num)
    }

    pub fn quorum_nodes(&self) -> &[Address] {
        let rf = self.replication_factor.clamp(1, self.nodes.len().max(1));
        &self.nodes[..rf.min(self.nodes.len())]
    }

    pub fn sync_nodes(&self) -> &[Address] {
        &self.nodes[self.quorum_nodes().len()..]
    }

    /// Streams with a replication factor of one commit to the registry only periodically.
    pub fn is_replicated(&self) -> bool {
        self.quorum_nodes().len() > 1
    }

    pub fn contains(&self, node: &Address) -> bool {
        self.nodes.contains(node)
    }
}

/// Placement of a stream as seen by one node: quorum and sync nodes, whether the node is one of them,
/// and which remote is currently preferred for fetching.
#[derive(Clone, Debug)]
pub struct StreamNodes {
    local: Address,
    quorum_nodes: Vec<Address>,
    sync_nodes: Vec<Address>,
    sticky_peer: usize,
}

impl StreamNodes {
    pub fn new(local: Address, nodes: &[Address], replication_factor: usize) -> StreamNodes {
        let mut stream_nodes =
            StreamNodes { local, quorum_nodes: Vec::new(), sync_nodes: Vec::new(), sticky_peer: 0 };
        stream_nodes.reset(nodes, replication_factor);
        stream_nodes
    }

    /// Replace the placement. The sticky peer is kept if it is still a remote.
    pub fn reset(&mut self, nodes: &[Address], replication_factor: usize) {
        let sticky = self.get_sticky_peer();
        let rf = replication_factor.clamp(1, nodes.len().max(1)).min(nodes.len());
        self.quorum_nodes = nodes[..rf].to_vec();
        self.sync_nodes = nodes[rf..].to_vec();
        let remotes = self.remotes();
        self.sticky_peer = sticky.and_then(|peer| remotes.iter().position(|node| *node == peer)).unwrap_or(0);
    }

    pub fn quorum_nodes(&self) -> &[Address] {
        &self.quorum_nodes
    }

    pub fn sync_nodes(&self) -> &[Address] {
        &self.sync_nodes
    }

    /// Every node that holds the stream, except the local one.
    pub fn remotes(&self) -> Vec<Address> {
        self.quorum_nodes.iter().chain(self.sync_nodes.iter()).filter(|node| **node != self.local).copied().collect()
    }

    pub fn get_remotes_and_is_local(&self) -> (Vec<Address>, bool) {
        (self.remotes(), self.is_local())
    }

    pub fn is_local(&self) -> bool {
        self.quorum_nodes.contains(&self.local) || self.sync_nodes.contains(&self.local)
    }

    pub fn is_local_in_quorum(&self) -> bool {
        self.quorum_nodes.contains(&self.local)
    }

    pub fn get_sticky_peer(&self) -> Option<Address> {
        let remotes = self.remotes();
        if remotes.is_empty() {
            None
        } else {
            Some(remotes[self.sticky_peer % remotes.len()])
        }
    }

    /// Move to the next remote in round-robin order if `current` is still the sticky peer.
    pub fn advance_sticky_peer(&mut self, current: &Address) -> Option<Address> {
        if self.get_sticky_peer().as_ref() == Some(current) {
            let remotes = self.remotes();
            if !remotes.is_empty() {
                self.sticky_peer = (self.sticky_peer + 1) % remotes.len();
            }
        }
        self.get_sticky_peer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8) -> Address {
        Address::new([i; 32])
    }

    #[test]
    fn quorum_and_sync_split() {
        let nodes = vec![node(1), node(2), node(3), node(4)];
        let stream_nodes = StreamNodes::new(node(4), &nodes, 3);
        assert_eq!(stream_nodes.quorum_nodes(), &nodes[..3]);
        assert_eq!(stream_nodes.sync_nodes(), &nodes[3..]);
        assert!(stream_nodes.is_local());
        assert!(!stream_nodes.is_local_in_quorum());
        assert_eq!(stream_nodes.remotes(), vec![node(1), node(2), node(3)]);
    }

    #[test]
    fn sticky_peer_round_robin() {
        let nodes = vec![node(1), node(2), node(3)];
        let mut stream_nodes = StreamNodes::new(node(1), &nodes, 3);
        assert_eq!(stream_nodes.get_sticky_peer(), Some(node(2)));
        assert_eq!(stream_nodes.advance_sticky_peer(&node(2)), Some(node(3)));
        // Advancing from a stale peer is a no-op.
        assert_eq!(stream_nodes.advance_sticky_peer(&node(2)), Some(node(3)));
        assert_eq!(stream_nodes.advance_sticky_peer(&node(3)), Some(node(2)));

        stream_nodes.reset(&[node(1)], 1);
        assert_eq!(stream_nodes.get_sticky_peer(), None);
    }
}
