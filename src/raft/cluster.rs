use super::{Index, NodeID, SnapshotSender};
use crate::encoding;

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The role of a node in the cluster membership. Only leaders and peers vote
/// and count towards quorums. Promotable and backup nodes receive the log but
/// don't vote, and clients only submit requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Leader,
    Peer,
    Promotable,
    Backup,
    Client,
}

impl NodeRole {
    /// Returns true if the role votes in elections and counts towards quorums.
    pub fn is_voter(&self) -> bool {
        matches!(self, NodeRole::Leader | NodeRole::Peer)
    }

    /// Returns true if the role receives log replication.
    pub fn is_replica(&self) -> bool {
        !matches!(self, NodeRole::Client)
    }
}

/// A network address of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportRecord {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl TransportRecord {
    /// Creates a TCP transport record.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self { protocol: "tcp".into(), host: host.into(), port }
    }

    /// Returns the address as host:port.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A cluster member. Identified by its name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: NodeID,
    pub group: String,
    pub role: NodeRole,
    /// Whether the node was reachable from the leader when the record was
    /// last published. Informational only.
    pub connected: bool,
    pub transports: Vec<TransportRecord>,
}

impl NodeRecord {
    /// Creates a new node record with the given role.
    pub fn new(name: impl Into<NodeID>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            group: String::new(),
            role,
            connected: false,
            transports: Vec::new(),
        }
    }

    /// Adds a transport address.
    pub fn with_transport(mut self, transport: TransportRecord) -> Self {
        self.transports.push(transport);
        self
    }
}

/// The cluster membership view. It is replicated through the Raft log as an
/// internal Config command, so all nodes converge on the same record. The
/// peers list includes every member, the local node included.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub name: String,
    pub peers: Vec<NodeRecord>,
}

impl encoding::Value for ClusterRecord {}

impl ClusterRecord {
    /// Creates a new cluster record.
    pub fn new(name: impl Into<String>, peers: Vec<NodeRecord>) -> Self {
        Self { name: name.into(), peers }
    }

    /// Looks up a member by name.
    pub fn get(&self, name: &str) -> Option<&NodeRecord> {
        self.peers.iter().find(|p| p.name == name)
    }

    /// Looks up a member by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut NodeRecord> {
        self.peers.iter_mut().find(|p| p.name == name)
    }

    /// Returns the names of the voting members, sorted.
    pub fn voters(&self) -> Vec<NodeID> {
        self.peers.iter().filter(|p| p.role.is_voter()).map(|p| p.name.clone()).sorted().collect()
    }
}

/// The local view of the cluster membership: the authoritative cluster record
/// (replaced only when a Config command is applied) plus local transport
/// connectivity, which is not replicated.
#[derive(Debug)]
pub struct Membership {
    id: NodeID,
    record: ClusterRecord,
    connected: HashSet<NodeID>,
}

impl Membership {
    /// Creates a membership view for the given local node.
    pub fn new(id: NodeID, record: ClusterRecord) -> Self {
        Self { id, record, connected: HashSet::new() }
    }

    /// Returns the cluster record.
    pub fn record(&self) -> &ClusterRecord {
        &self.record
    }

    /// Replaces the cluster record, e.g. when a Config command is applied.
    /// Connectivity of nodes that are no longer members is dropped.
    pub fn set_record(&mut self, record: ClusterRecord) {
        self.connected.retain(|id| record.get(id).is_some());
        self.record = record;
    }

    /// Returns true if the node is a cluster member (any role except client).
    pub fn contains(&self, id: &str) -> bool {
        self.record.get(id).is_some_and(|p| p.role.is_replica())
    }

    /// Returns true if the node votes.
    pub fn is_voter(&self, id: &str) -> bool {
        self.record.get(id).is_some_and(|p| p.role.is_voter())
    }

    /// Returns the replication targets: all members except the local node and
    /// clients, sorted for determinism.
    pub fn peers(&self) -> Vec<NodeID> {
        self.record
            .peers
            .iter()
            .filter(|p| p.role.is_replica() && p.name != self.id)
            .map(|p| p.name.clone())
            .sorted()
            .collect()
    }

    /// Returns the voting peers, excluding the local node.
    pub fn voting_peers(&self) -> Vec<NodeID> {
        self.record.voters().into_iter().filter(|id| *id != self.id).collect()
    }

    /// Returns the number of voters, including the local node if it votes.
    pub fn voters(&self) -> usize {
        self.record.voters().len()
    }

    /// Returns the quorum size: a strict majority of the configured voters,
    /// regardless of how many are currently reachable.
    pub fn quorum_size(&self) -> usize {
        super::node::quorum_size(self.voters())
    }

    /// Marks a peer as connected or disconnected. Returns true if the state
    /// changed.
    pub fn set_connected(&mut self, id: &str, connected: bool) -> bool {
        if connected {
            self.connected.insert(id.to_string())
        } else {
            self.connected.remove(id)
        }
    }

    /// Returns true if the peer is connected.
    pub fn is_connected(&self, id: &str) -> bool {
        self.connected.contains(id)
    }

    /// Returns true if the local node can reach a quorum of voters,
    /// counting itself.
    pub fn can_reach_quorum(&self) -> bool {
        let reachable = self
            .record
            .voters()
            .into_iter()
            .filter(|id| *id == self.id || self.connected.contains(id))
            .count();
        reachable >= self.quorum_size()
    }

    /// Returns a copy of the cluster record with the given leader, other
    /// voters as peers, and connectivity as seen from the local node.
    pub fn leader_view(&self) -> ClusterRecord {
        let mut record = self.record.clone();
        for peer in record.peers.iter_mut() {
            if peer.name == self.id {
                peer.role = NodeRole::Leader;
                peer.connected = true;
            } else {
                if peer.role == NodeRole::Leader {
                    peer.role = NodeRole::Peer;
                }
                peer.connected = self.connected.contains(&peer.name);
            }
        }
        record
    }
}

/// How the leader replicates to a follower.
#[derive(Debug)]
pub enum Mode {
    /// Entries are sent from the log.
    Replicate,
    /// The follower needs entries that were compacted away, and is receiving
    /// a snapshot. Returns to Replicate once every chunk is acknowledged.
    Snapshot(SnapshotSender),
}

/// Follower replication progress, tracked by the leader.
#[derive(Debug)]
pub struct Progress {
    /// The next index to replicate to the follower.
    pub next: Index,
    /// The last index known to match the leader's log.
    pub matched: Index,
    /// The replication mode.
    pub mode: Mode,
}

impl Progress {
    /// Creates progress for a follower. The next index assumes it is caught
    /// up until shown otherwise, but nothing is known to match yet.
    pub fn new(last_index: Index) -> Self {
        Self { next: last_index + 1, matched: 0, mode: Mode::Replicate }
    }

    /// Records that the follower's log matches up to the given index. Returns
    /// true if the match index advanced.
    pub fn advance(&mut self, matched: Index) -> bool {
        self.next = self.next.max(matched + 1);
        if matched <= self.matched {
            return false;
        }
        self.matched = matched;
        true
    }

    /// Backs off the next index after a rejected append. The follower's last
    /// index bounds how far back we must go. Returns false if the rejection
    /// was stale.
    pub fn regress(&mut self, rejected: Index, last_index: Index) -> bool {
        if rejected != self.next - 1 {
            return false;
        }
        self.next = (self.next - 1).min(last_index + 1).max(self.matched + 1).max(1);
        true
    }
}
