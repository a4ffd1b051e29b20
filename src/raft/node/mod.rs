mod candidate;
mod follower;
mod leader;

use super::{
    Applied, ClusterRecord, Command, Envelope, Index, Log, Machine, Membership, Message, Metadata,
    NodeRecord, SnapshotStore, State, Status, ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL,
    MAX_APPEND_BYTES, SEGMENT_SIZE,
};
use crate::error::Result;
use crate::{errdata, errinput};
pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

use fs2::FileExt as _;
use log::{debug, info, warn};
use rand::Rng as _;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// A node ID: the node's name in the cluster record. Clients are identified
/// by name too.
pub type NodeID = String;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// Raft node options.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// The maximum size of the entries in an Append message. At least one
    /// entry is always sent.
    pub max_append_bytes: usize,
    /// The size of log segment files.
    pub segment_size: usize,
    /// The size of snapshot transfer chunks.
    pub snapshot_chunk_size: usize,
    /// The size of the snapshot file windows mapped during transfers.
    pub snapshot_map_size: usize,
    /// The maximum number of unacknowledged snapshot chunks.
    pub snapshot_inflight: usize,
    /// The number of ticks without acknowledgement before a snapshot transfer
    /// is retried from the last acknowledged chunk.
    pub snapshot_timeout: Ticks,
    /// Whether to fsync writes. Disabling this risks data loss on crashes.
    pub fsync: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            max_append_bytes: MAX_APPEND_BYTES,
            segment_size: SEGMENT_SIZE,
            snapshot_chunk_size: 256 * 1024,
            snapshot_map_size: 16 * 1024 * 1024,
            snapshot_inflight: 4,
            snapshot_timeout: HEARTBEAT_INTERVAL * 2,
            fsync: true,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a possibly
/// different role. Outbound messages are sent via the given node_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual
/// node logic. It exists for ergonomic use across role transitions, i.e
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Opens a Raft node in the given data directory, starting as a leaderless
    /// follower, or leader if it is the only voter.
    ///
    /// The directory is locked for the lifetime of the node. If it has no valid
    /// metadata, any existing log and snapshot is discarded and the node starts
    /// from scratch with the given cluster record. Otherwise, the persisted
    /// cluster record is used, and the node recovers its snapshot and log.
    pub fn new(
        dir: &Path,
        node: NodeRecord,
        cluster: ClusterRecord,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(dir, node, cluster, state, node_tx, opts)?;
        if node.membership.is_voter(&node.id) && node.membership.voting_peers().is_empty() {
            // If there are no other voters, become leader immediately.
            return node.into_candidate()?.maybe_win();
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Returns the applied cluster record.
    pub fn cluster(&self) -> &ClusterRecord {
        match self {
            Node::Candidate(n) => n.membership.record(),
            Node::Follower(n) => n.membership.record(),
            Node::Leader(n) => n.membership.record(),
        }
    }

    /// Processes a message from a peer or client.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {:?}", msg);
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    /// Announces the node on a new connection to a peer. The peer is
    /// considered connected once it responds.
    pub fn connected(&mut self, peer: &str) -> Result<()> {
        match self {
            Node::Candidate(n) => n.connected(peer),
            Node::Follower(n) => n.connected(peer),
            Node::Leader(n) => n.connected(peer),
        }
    }

    /// Records that the connection to a peer or client was lost.
    pub fn disconnected(&mut self, peer: &str) -> Result<()> {
        match self {
            Node::Candidate(n) => n.disconnected(peer),
            Node::Follower(n) => n.disconnected(peer),
            Node::Leader(n) => n.leader_disconnected(peer),
        }
    }

    /// Flushes the log and compacts it if a snapshot would allow deleting a
    /// segment. Called after every batch of steps and ticks.
    pub fn maintain(&mut self) -> Result<()> {
        match self {
            Node::Candidate(n) => n.maintain(),
            Node::Follower(n) => n.maintain(),
            Node::Leader(n) => n.maintain(),
        }
    }

    /// Returns the node status.
    pub fn status(&self) -> Status {
        match self {
            Node::Candidate(n) => n.status("candidate", None, BTreeMap::new()),
            Node::Follower(n) => n.status("follower", n.role.leader.clone(), BTreeMap::new()),
            Node::Leader(n) => n.leader_status(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role: std::fmt::Debug {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states (roles)
/// are encoded as RawNode<Role>. See: http://cliffle.com/blog/rust-typestate/
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    term: Term,
    membership: Membership,
    log: Log,
    machine: Machine,
    snapshots: SnapshotStore,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    /// Holds the data directory lock.
    _lock: File,
    role: R,
}

impl RawNode<Follower> {
    /// Opens a node as a leaderless follower. See Node::new().
    fn new(
        dir: &Path,
        node: NodeRecord,
        cluster: ClusterRecord,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        if !cluster.get(&node.name).is_some_and(|n| n.role.is_replica()) {
            return errinput!("node {} is not a member of cluster {}", node.name, cluster.name);
        }
        std::fs::create_dir_all(dir)?;
        let lock = std::fs::OpenOptions::new().create(true).truncate(false).write(true).open(dir.join("LOCK"))?;
        lock.try_lock_exclusive()?;

        let snapshots = SnapshotStore::new(dir, &cluster.name, opts.fsync).with_transfer(
            opts.snapshot_chunk_size,
            opts.snapshot_map_size,
            opts.snapshot_inflight,
        );
        let meta = match Metadata::load(dir, &node.name, &cluster.name)? {
            Some(meta) => meta,
            None => {
                info!("Initializing node {} in cluster {}", node.name, cluster.name);
                Log::purge(dir)?;
                snapshots.delete()?;
                let meta = Metadata { node, cluster, term: 0, vote: None };
                meta.save(dir, opts.fsync)?;
                meta
            }
        };

        let id = meta.node.name.clone();
        let membership = Membership::new(id.clone(), meta.cluster.clone());
        let mut machine = Machine::new(state, meta.cluster.clone());
        let snapshot = snapshots.load(&mut machine)?.unwrap_or((0, 0));
        let log = Log::open(dir, meta, snapshot, opts.segment_size, opts.fsync)?;
        let (term, voted_for) = log.get_term();
        let mut node = Self {
            id,
            term,
            membership,
            log,
            machine,
            snapshots,
            node_tx,
            opts,
            _lock: lock,
            role: Follower::new(None, voted_for, 0),
        };
        node.role.election_timeout = node.gen_election_timeout();
        info!("Opened node {} at term {} with applied index {}", node.id, term, snapshot.0);
        Ok(node)
    }
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            term: self.term,
            membership: self.membership,
            log: self.log,
            machine: self.machine,
            snapshots: self.snapshots,
            node_tx: self.node_tx,
            opts: self.opts,
            _lock: self._lock,
            role,
        }
    }

    /// Applies any pending, committed entries to the state machine. The
    /// results are discarded, use maybe_apply_with() instead to access them.
    fn maybe_apply(&mut self) -> Result<()> {
        self.maybe_apply_with(|_, _| Ok(()))
    }

    /// Like maybe_apply(), but calls the given closure with the result of
    /// every applied entry. Applied Config and Join commands replace the
    /// membership record before the closure is called.
    fn maybe_apply_with<F>(&mut self, mut on_apply: F) -> Result<()>
    where
        F: FnMut(&mut Self, Applied) -> Result<()>,
    {
        loop {
            let (applied_index, _) = self.machine.get_applied_index();
            let (commit_index, _) = self.log.get_commit_index();
            assert!(commit_index >= applied_index, "commit index below applied index");
            if applied_index >= commit_index {
                return Ok(());
            }
            let Some(entry) = self.log.get(applied_index + 1)? else {
                return errdata!("committed entry {} missing", applied_index + 1);
            };
            let applied = self.machine.apply(&entry)?;
            if let Some(Command::Config(_) | Command::Join(_)) = &applied.command {
                let cluster = self.machine.cluster().clone();
                info!("Applied cluster record {cluster:?}");
                self.membership.set_record(cluster.clone());
                self.log.set_cluster(cluster)?;
            }
            on_apply(self, applied)?;
        }
    }

    /// Sends a message.
    fn send(&self, to: &str, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id.clone(), to: to.to_string(), term: self.term, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all voting peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sorted for test determinism.
        for id in self.membership.voting_peers() {
            self.send(&id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Returns true if a log with the given last index and term is at least
    /// as up-to-date as ours.
    fn is_up_to_date(&self, last_index: Index, last_term: Term) -> bool {
        let (log_index, log_term) = self.log.get_last_index();
        last_term > log_term || last_term == log_term && last_index >= log_index
    }

    /// Checks the term and sender of Raft messages. Messages from non-members
    /// are dropped, as are messages from past terms. Requests from past terms
    /// are rejected, which informs the sender of the current term. Returns
    /// true if the message should be dropped.
    fn drop_message(&self, msg: &Envelope) -> Result<bool> {
        if !self.membership.contains(&msg.from) {
            warn!("Dropping message from non-member {}", msg.from);
            return Ok(true);
        }
        if msg.term >= self.term {
            return Ok(false);
        }
        debug!("Dropping message from past term ({msg:?})");
        let reject = match &msg.message {
            Message::PreVote { term, .. } => Message::PreVoteResponse { term: *term, vote: false },
            Message::Campaign { .. } => Message::CampaignResponse { vote: false },
            Message::Append { base_index, .. } => Message::AppendResponse {
                success: false,
                index: *base_index,
                last_index: self.log.get_last_index().0,
            },
            Message::InstallSnapshot { index, offset, .. } => {
                Message::InstallSnapshotResponse { index: *index, offset: *offset, success: false }
            }
            _ => return Ok(true),
        };
        self.send(&msg.from, reject)?;
        Ok(true)
    }

    /// Announces the node to a newly connected peer.
    fn connected(&mut self, peer: &str) -> Result<()> {
        debug!("Connected to {peer}");
        let cluster = self.membership.record().name.clone();
        self.send(peer, Message::ConnectRequest { cluster, client: false })
    }

    /// Records a lost connection.
    fn disconnected(&mut self, peer: &str) -> Result<()> {
        if self.membership.set_connected(peer, false) {
            info!("Disconnected from {peer}");
        }
        Ok(())
    }

    /// Handles a peer's ConnectRequest, marking it as connected if it belongs
    /// to the cluster. Returns true if the connectivity changed.
    fn accept_peer(&mut self, from: &str, cluster: &str, leader: Option<NodeID>) -> Result<bool> {
        let success = cluster == self.membership.record().name && self.membership.contains(from);
        if !success {
            warn!("Rejecting connection from {from} in cluster {cluster}");
        }
        self.send(
            from,
            Message::ConnectResponse {
                success,
                leader,
                cluster: self.membership.record().clone(),
                sequence: 0,
                acknowledge: 0,
            },
        )?;
        Ok(success && self.membership.set_connected(from, true))
    }

    /// Handles a peer's ConnectResponse. Returns true if the connectivity
    /// changed.
    fn peer_accepted(&mut self, from: &str, success: bool) -> bool {
        if !success {
            warn!("Peer {from} refused connection");
            return false;
        }
        self.membership.contains(from) && self.membership.set_connected(from, true)
    }

    /// Refuses a client connection, pointing it to the leader if known.
    fn refuse_client(&self, from: &str, leader: Option<NodeID>) -> Result<()> {
        debug!("Refusing client {from}, leader is {leader:?}");
        self.send(
            from,
            Message::ConnectResponse {
                success: false,
                leader,
                cluster: self.membership.record().clone(),
                sequence: 0,
                acknowledge: 0,
            },
        )
    }

    /// Generates a status report.
    fn status(&self, role: &str, leader: Option<NodeID>, match_index: BTreeMap<NodeID, Index>) -> Status {
        Status {
            node: self.id.clone(),
            role: role.to_string(),
            leader,
            term: self.term,
            match_index,
            applied_index: self.machine.get_applied_index().0,
            sessions: self.machine.sessions().sessions().count(),
            cluster: self.membership.record().clone(),
            log: self.log.status(),
        }
    }

    /// Flushes the log, and takes a snapshot and compacts the log if that
    /// would allow removing a segment.
    fn maintain(&mut self) -> Result<()> {
        self.log.flush()?;
        let (applied_index, applied_term) = self.machine.get_applied_index();
        if self.log.should_compact(applied_index) {
            self.snapshots.take(&self.machine)?;
            self.log.compact(applied_index, applied_term)?;
        }
        Ok(())
    }

    /// Asserts common node invariants.
    fn assert_node(&self) {
        debug_assert_eq!(self.term, self.log.get_term().0, "Term does not match log");
        debug_assert!(
            self.machine.get_applied_index().0 <= self.log.get_commit_index().0,
            "Applied index above commit index"
        );
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        // Messages must be addressed to the local node.
        assert_eq!(msg.to, self.id, "Message to other node");
    }
}

/// Returns the size of a quorum (strict majority), given a total size.
pub(super) fn quorum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Returns the quorum (median) value of the given unsorted slice, in descending
/// order. The slice cannot be empty.
fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size(values.len()) - 1;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}

#[cfg(test)]
pub mod tests {
    pub use super::super::state::tests::TestState;
    use super::super::{decode_records, NodeRole, Sequence};
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    /// A deterministic in-process cluster. Nodes only tick when told to, and
    /// messages are delivered synchronously between them until the cluster
    /// is quiescent. Messages to and from partitioned nodes are dropped, and
    /// messages addressed to non-members are collected as client messages.
    pub struct Cluster {
        pub ids: Vec<NodeID>,
        pub nodes: BTreeMap<NodeID, Node>,
        pub states: BTreeMap<NodeID, TestState>,
        pub opts: Options,
        dir: tempfile::TempDir,
        record: ClusterRecord,
        rx: BTreeMap<NodeID, crossbeam::channel::Receiver<Envelope>>,
        tx: BTreeMap<NodeID, crossbeam::channel::Sender<Envelope>>,
        partitioned: HashSet<NodeID>,
        pub clients: Vec<Envelope>,
    }

    impl Cluster {
        /// Creates and connects a cluster of voters with the given names.
        pub fn new(ids: &[&str], opts: Options) -> Result<Self> {
            let record = ClusterRecord::new("test", ids.iter().map(|id| NodeRecord::new(*id, NodeRole::Peer)).collect());
            let mut cluster = Self {
                ids: ids.iter().map(|id| id.to_string()).collect(),
                nodes: BTreeMap::new(),
                states: BTreeMap::new(),
                opts,
                dir: tempfile::Builder::new().prefix("cluster").tempdir()?,
                record,
                rx: BTreeMap::new(),
                tx: BTreeMap::new(),
                partitioned: HashSet::new(),
                clients: Vec::new(),
            };
            for id in cluster.ids.clone() {
                cluster.start(&id)?;
            }
            cluster.connect()?;
            Ok(cluster)
        }

        /// Starts (or restarts) a node, with an empty state machine.
        pub fn start(&mut self, id: &str) -> Result<()> {
            let (tx, rx) = crossbeam::channel::unbounded();
            let state = TestState::default();
            let record = self.record.get(id).cloned().unwrap_or_else(|| NodeRecord::new(id, NodeRole::Peer));
            let node = Node::new(
                &self.dir.path().join(id),
                record,
                self.record.clone(),
                Box::new(state.clone()),
                tx.clone(),
                self.opts.clone(),
            )?;
            self.nodes.insert(id.to_string(), node);
            self.states.insert(id.to_string(), state);
            self.rx.insert(id.to_string(), rx);
            self.tx.insert(id.to_string(), tx);
            Ok(())
        }

        /// Stops a node, as if it crashed. Pending outbound messages are lost.
        pub fn stop(&mut self, id: &str) {
            self.nodes.remove(id);
            self.rx.remove(id);
            for other in self.ids.clone() {
                if let Some(node) = self.nodes.get_mut(&other) {
                    node.disconnected(id).expect("disconnect");
                }
            }
        }

        /// Starts a node that joined the cluster, using the cluster record it
        /// joined with, and connects it to the running nodes.
        pub fn add_node(&mut self, id: &str, record: ClusterRecord) -> Result<()> {
            self.ids.push(id.to_string());
            self.record = record;
            self.start(id)?;
            for other in self.ids.clone() {
                if other == id || !self.nodes.contains_key(&other) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(id) {
                    node.connected(&other)?;
                }
                if let Some(node) = self.nodes.get_mut(&other) {
                    node.connected(id)?;
                }
            }
            self.deliver()
        }

        /// Returns the data directory of a node.
        pub fn dir(&self, id: &str) -> std::path::PathBuf {
            self.dir.path().join(id)
        }

        /// Connects all running node pairs.
        pub fn connect(&mut self) -> Result<()> {
            for from in self.ids.clone() {
                for to in self.ids.clone() {
                    if from != to && self.nodes.contains_key(&to) {
                        if let Some(node) = self.nodes.get_mut(&from) {
                            node.connected(&to)?;
                        }
                    }
                }
            }
            self.deliver()
        }

        /// Partitions a node, dropping all messages to and from it. The
        /// transport connections are considered intact.
        pub fn partition(&mut self, id: &str) {
            self.partitioned.insert(id.to_string());
        }

        /// Heals all partitions.
        pub fn heal(&mut self) {
            self.partitioned.clear();
        }

        /// Returns a node.
        pub fn node(&self, id: &str) -> &Node {
            &self.nodes[id]
        }

        /// Returns a node's status.
        pub fn status(&self, id: &str) -> Status {
            self.node(id).status()
        }

        /// Steps a message into its recipient, returning the recipient's
        /// outbound messages without delivering them.
        pub fn step(&mut self, msg: Envelope) -> Result<Vec<Envelope>> {
            let to = msg.to.clone();
            let Some(node) = self.nodes.remove(&to) else { return errdata!("unknown node {to}") };
            self.nodes.insert(to.clone(), node.step(msg)?);
            Ok(self.rx[&to].try_iter().collect())
        }

        /// Ticks a node, returning its outbound messages without delivering
        /// them.
        pub fn tick_raw(&mut self, id: &str) -> Result<Vec<Envelope>> {
            let Some(node) = self.nodes.remove(id) else { return errdata!("unknown node {id}") };
            self.nodes.insert(id.to_string(), node.tick()?);
            Ok(self.rx[id].try_iter().collect())
        }

        /// Ticks a node and delivers messages until the cluster is quiescent.
        pub fn tick(&mut self, id: &str) -> Result<()> {
            for msg in self.tick_raw(id)? {
                self.route(msg)?;
            }
            self.deliver()
        }

        /// Ticks a node for a heartbeat interval.
        pub fn heartbeat(&mut self, id: &str) -> Result<()> {
            for _ in 0..self.opts.heartbeat_interval {
                self.tick(id)?;
            }
            Ok(())
        }

        /// Delivers messages until the cluster is quiescent, and runs
        /// maintenance on all nodes.
        pub fn deliver(&mut self) -> Result<()> {
            loop {
                let msgs: Vec<Envelope> = self.rx.values().flat_map(|rx| rx.try_iter()).collect();
                if msgs.is_empty() {
                    break;
                }
                for msg in msgs {
                    self.route(msg)?;
                }
            }
            for node in self.nodes.values_mut() {
                node.maintain()?;
            }
            Ok(())
        }

        /// Routes a message to its recipient.
        fn route(&mut self, msg: Envelope) -> Result<()> {
            if self.partitioned.contains(&msg.from) || self.partitioned.contains(&msg.to) {
                return Ok(());
            }
            if !self.ids.contains(&msg.to) {
                self.clients.push(msg);
                return Ok(());
            }
            if self.nodes.contains_key(&msg.to) {
                self.step(msg)?.into_iter().try_for_each(|msg| self.tx[&msg.from].send(msg))?;
            }
            Ok(())
        }

        /// Ticks a node until it loses its leader.
        pub fn forget_leader(&mut self, id: &str) -> Result<()> {
            for _ in 0..=self.opts.election_timeout_range.end {
                if self.status(id).leader.is_none() {
                    return Ok(());
                }
                self.tick(id)?;
            }
            panic!("{id} did not lose its leader");
        }

        /// Elects the given node as leader, by having all other reachable
        /// followers lose their leader and then ticking the node until it
        /// wins an election and has started its term.
        pub fn elect(&mut self, id: &str) -> Result<()> {
            for other in self.ids.clone() {
                if other != id && self.nodes.contains_key(&other) && !self.partitioned.contains(&other) {
                    if let Node::Follower(_) = self.node(&other) {
                        self.forget_leader(&other)?;
                    }
                }
            }
            for _ in 0..=self.opts.election_timeout_range.end {
                if let Node::Leader(n) = self.node(id) {
                    if n.role.term_started {
                        return Ok(());
                    }
                }
                self.tick(id)?;
            }
            panic!("{id} did not win election");
        }

        /// Submits a client message to a node and delivers messages.
        pub fn client_send(&mut self, client: &str, to: &str, message: Message) -> Result<()> {
            let msg = Envelope { from: client.to_string(), to: to.to_string(), term: 0, message };
            self.route(msg)?;
            self.deliver()
        }

        /// Registers a client session with the leader. Returns the response.
        pub fn register(&mut self, client: &str, leader: &str) -> Result<Message> {
            self.client_send(client, leader, Message::ConnectRequest { cluster: "test".into(), client: true })?;
            Ok(self.take_client(client).pop().expect("no response").message)
        }

        /// Submits a client request and returns the responses it got.
        pub fn submit(&mut self, client: &str, leader: &str, sequence: Sequence, command: &str) -> Result<Vec<Message>> {
            let message = Message::ClientRequest { sequence, acknowledge: 0, command: command.as_bytes().to_vec() };
            self.client_send(client, leader, message)?;
            Ok(self.take_client(client).into_iter().map(|msg| msg.message).collect())
        }

        /// Takes the pending messages for a client, ignoring publications.
        pub fn take_client(&mut self, client: &str) -> Vec<Envelope> {
            let (msgs, rest) = std::mem::take(&mut self.clients).into_iter().partition(|msg| msg.to == client);
            self.clients = rest;
            msgs.into_iter().filter(|msg| !matches!(msg.message, Message::Publish { .. })).collect()
        }

        /// Asserts that all running nodes have the same applied index and
        /// state machine data as the given node.
        #[track_caller]
        pub fn assert_converged(&self, id: &str) {
            let expect = self.status(id);
            for other in self.nodes.keys() {
                assert_eq!(self.status(other).applied_index, expect.applied_index, "applied index of {other}");
                assert_eq!(self.states[other].data(), self.states[id].data(), "state of {other}");
            }
        }
    }

    /// Options for tests: fast timeouts, small segments, and no fsync.
    pub fn test_options() -> Options {
        Options { election_timeout_range: 10..15, segment_size: 64 * 1024, fsync: false, ..Options::default() }
    }

    fn ok(sequence: Sequence, data: &str) -> Message {
        Message::ClientResponse { sequence, response: Ok(data.as_bytes().to_vec()) }
    }

    #[test]
    fn quorum_size() {
        for (size, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4), (8, 5)] {
            assert_eq!(super::quorum_size(size), quorum);
        }
    }

    #[test]
    fn quorum_value() {
        assert_eq!(super::quorum_value(vec![1]), 1);
        assert_eq!(super::quorum_value(vec![1, 3, 2]), 2);
        assert_eq!(super::quorum_value(vec![4, 1, 3, 2]), 2);
        assert_eq!(super::quorum_value(vec![1, 1, 1, 2, 2]), 1);
        assert_eq!(super::quorum_value(vec![1, 1, 2, 2, 2]), 2);
    }

    #[test]
    fn single_node_is_leader() -> Result<()> {
        let cluster = Cluster::new(&["a"], test_options())?;
        let status = cluster.status("a");
        assert_eq!((status.role.as_str(), status.term), ("leader", 1));
        // The noop and the leader's cluster record are committed and applied.
        assert_eq!(status.applied_index, 2);
        assert_eq!(status.cluster.get("a").map(|n| n.role), Some(NodeRole::Leader));
        Ok(())
    }

    #[test]
    fn non_member_is_rejected() -> Result<()> {
        let dir = tempfile::Builder::new().prefix("node").tempdir()?;
        let (tx, _rx) = crossbeam::channel::unbounded();
        let record = ClusterRecord::new("test", vec![NodeRecord::new("a", NodeRole::Peer)]);
        let result = Node::new(
            dir.path(),
            NodeRecord::new("x", NodeRole::Peer),
            record,
            Box::new(TestState::default()),
            tx,
            test_options(),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn data_dir_is_locked() -> Result<()> {
        let cluster = Cluster::new(&["a"], test_options())?;
        let (tx, _rx) = crossbeam::channel::unbounded();
        let result = Node::new(
            &cluster.dir("a"),
            NodeRecord::new("a", NodeRole::Peer),
            cluster.record.clone(),
            Box::new(TestState::default()),
            tx,
            test_options(),
        );
        assert!(matches!(result, Err(Error::IO(_))));
        Ok(())
    }

    #[test]
    fn elect_leader() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.heartbeat("a")?;

        for id in ["a", "b", "c"] {
            let status = c.status(id);
            assert_eq!(status.term, 1, "term of {id}");
            assert_eq!(status.log.commit_index, 2, "commit index of {id}");
            assert_eq!(status.applied_index, 2, "applied index of {id}");
        }
        assert_eq!(c.status("b").leader.as_deref(), Some("a"));
        assert_eq!(c.status("c").leader.as_deref(), Some("a"));

        // The leader's view of the cluster was replicated.
        let cluster = c.status("c").cluster;
        let roles: Vec<_> = cluster.peers.iter().map(|p| (p.name.as_str(), p.role, p.connected)).collect();
        assert_eq!(
            roles,
            vec![("a", NodeRole::Leader, true), ("b", NodeRole::Peer, true), ("c", NodeRole::Peer, true)]
        );
        Ok(())
    }

    #[test]
    fn reelection_after_leader_failure() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.stop("a");
        c.elect("b")?;
        c.heartbeat("b")?;
        assert_eq!(c.status("b").term, 2);
        assert_eq!(c.status("c").leader.as_deref(), Some("b"));
        let cluster = c.status("c").cluster;
        assert_eq!(cluster.get("a").map(|n| (n.role, n.connected)), Some((NodeRole::Peer, false)));
        assert_eq!(cluster.get("b").map(|n| n.role), Some(NodeRole::Leader));
        Ok(())
    }

    #[test]
    fn partitioned_node_does_not_disrupt() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.partition("c");

        // The partitioned node keeps running pre-votes that go nowhere, but
        // never increases its term.
        for _ in 0..100 {
            c.tick("c")?;
        }
        assert_eq!(c.status("c").term, 1);
        assert_eq!(c.status("c").leader, None);

        // Once healed, its pre-votes are refused by nodes that have a leader,
        // and it rejoins the existing leader without an election.
        c.heal();
        c.forget_leader("c")?;
        c.tick("c")?;
        c.heartbeat("a")?;
        for id in ["a", "b", "c"] {
            assert_eq!(c.status(id).term, 1, "term of {id}");
        }
        assert_eq!(c.status("a").role, "leader");
        assert_eq!(c.status("c").leader.as_deref(), Some("a"));
        Ok(())
    }

    #[test]
    fn disconnected_node_does_not_campaign() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        for id in ["a", "b"] {
            c.nodes.get_mut("c").expect("node").disconnected(id)?;
        }
        for _ in 0..50 {
            let msgs = c.tick_raw("c")?;
            assert!(msgs.is_empty(), "unexpected messages {msgs:?}");
        }
        Ok(())
    }

    #[test]
    fn commits_batch_in_one_round() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;

        // Submit three writes while the followers are unreachable.
        c.partition("b");
        c.partition("c");
        for (sequence, command) in [(1, "x=1"), (2, "y=2"), (3, "z=3")] {
            assert_eq!(c.submit("client", "a", sequence, command)?, vec![]);
        }
        c.heal();

        // The next heartbeat carries all three entries to each follower.
        let mut msgs = Vec::new();
        for _ in 0..c.opts.heartbeat_interval {
            msgs.extend(c.tick_raw("a")?);
        }
        let appends: Vec<_> = msgs
            .iter()
            .filter_map(|msg| match &msg.message {
                Message::Append { entries, .. } => Some(decode_records(entries).map(|e| e.len())),
                _ => None,
            })
            .collect::<Result<_>>()?;
        assert_eq!(appends, vec![3, 3]);

        // A single round of responses commits and applies the batch.
        let commit = c.status("a").log.commit_index;
        for msg in msgs {
            for response in c.step(msg)? {
                let replies = c.step(response)?;
                c.clients.extend(replies.into_iter().filter(|msg| msg.to == "client"));
            }
        }
        assert_eq!(c.status("a").log.commit_index, commit + 3);
        let responses: Vec<_> = c.take_client("client").into_iter().map(|msg| msg.message).collect();
        assert_eq!(responses, vec![ok(1, ""), ok(2, ""), ok(3, "")]);
        Ok(())
    }

    #[test]
    fn truncates_conflicting_entries() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;
        c.heartbeat("a")?;

        // The old leader appends entries that never replicate.
        c.partition("a");
        let msgs = c.step(Envelope {
            from: "client".into(),
            to: "a".into(),
            term: 0,
            message: Message::ClientRequest { sequence: 1, acknowledge: 0, command: b"x=1".to_vec() },
        })?;
        assert!(msgs.iter().all(|msg| matches!(msg.message, Message::Append { .. })));
        let stale = c.status("a").log.last_index;

        // A new leader is elected and commits other entries.
        c.elect("b")?;
        c.register("client", "b")?;
        assert_eq!(c.submit("client", "b", 1, "x=2")?, vec![ok(1, "")]);

        // Once healed, the old leader steps down, aborts its pending write, and
        // replaces its conflicting entries.
        c.heal();
        c.heartbeat("b")?;
        c.heartbeat("b")?;
        assert_eq!(c.status("a").role, "follower");
        assert_eq!(c.take_client("client").into_iter().map(|msg| msg.message).collect::<Vec<_>>(), vec![
            Message::ClientResponse { sequence: 1, response: Err(Error::Abort) }
        ]);
        let status = c.status("a");
        assert_eq!(status.log.last_index, c.status("b").log.last_index);
        assert!(status.log.last_index >= stale);
        c.assert_converged("b");
        assert_eq!(c.states["a"].data().get("x").map(|v| v.as_str()), Some("2"));
        Ok(())
    }

    #[test]
    fn deduplicates_retries() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;
        assert_eq!(c.submit("client", "a", 1, "x=1")?, vec![ok(1, "")]);
        assert_eq!(c.submit("client", "a", 2, "x=2")?, vec![ok(2, "1")]);

        // A retry returns the original response, without reapplying.
        assert_eq!(c.submit("client", "a", 1, "x=1")?, vec![ok(1, "")]);
        c.heartbeat("a")?;
        for id in ["a", "b", "c"] {
            let applied: Vec<_> = c.states[id].applied().into_iter().map(|(_, command)| command).collect();
            assert_eq!(applied, vec![b"x=1".to_vec(), b"x=2".to_vec()], "applied commands on {id}");
        }

        // Re-registering resumes the session.
        let response = c.register("client", "a")?;
        assert!(matches!(response, Message::ConnectResponse { success: true, sequence: 2, .. }));
        Ok(())
    }

    #[test]
    fn dedups_across_leader_change() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;
        assert_eq!(c.submit("client", "a", 1, "x=1")?, vec![ok(1, "")]);

        // The new leader answers a retry from the replicated session table.
        c.stop("a");
        c.elect("b")?;
        let response = c.register("client", "b")?;
        assert!(matches!(response, Message::ConnectResponse { success: true, sequence: 1, .. }));
        assert_eq!(c.submit("client", "b", 1, "x=1")?, vec![ok(1, "")]);
        assert_eq!(c.states["b"].applied().len(), 1);
        Ok(())
    }

    #[test]
    fn snapshot_transfer() -> Result<()> {
        let opts = Options {
            segment_size: 1024,
            snapshot_chunk_size: 64,
            snapshot_map_size: 256,
            snapshot_inflight: 2,
            ..test_options()
        };
        let mut c = Cluster::new(&["a", "b", "c"], opts)?;
        c.elect("a")?;
        c.register("client", "a")?;

        c.partition("c");
        for sequence in 1..=60 {
            let command = format!("key{sequence}=value{sequence}");
            assert_eq!(c.submit("client", "a", sequence, &command)?, vec![ok(sequence, "")]);
        }
        let snapshot_index = c.status("a").log.snapshot_index;
        assert!(snapshot_index > 0, "leader did not compact");
        assert_eq!(c.status("c").log.last_index, 3);

        // The follower needs compacted entries, so it is sent the snapshot and
        // then caught up from the log.
        c.heal();
        for _ in 0..5 {
            c.heartbeat("a")?;
        }
        let status = c.status("c");
        assert!(status.log.snapshot_index >= snapshot_index);
        assert_eq!(status.log.last_index, c.status("a").log.last_index);
        c.assert_converged("a");
        assert_eq!(c.states["c"].data().len(), 60);
        Ok(())
    }

    #[test]
    fn restart_recovers_from_snapshot_and_log() -> Result<()> {
        let opts = Options { segment_size: 1024, ..test_options() };
        let mut c = Cluster::new(&["a"], opts)?;
        c.register("client", "a")?;
        for sequence in 1..=40 {
            c.submit("client", "a", sequence, &format!("key{sequence}=value{sequence}"))?;
        }
        let before = c.status("a");
        assert!(before.log.snapshot_index > 0);

        c.stop("a");
        c.start("a")?;
        let after = c.status("a");
        assert_eq!(after.term, before.term + 1);
        assert_eq!(after.applied_index, before.log.last_index + 1);
        assert_eq!(c.states["a"].data().len(), 40);
        assert_eq!(after.sessions, 1);
        Ok(())
    }

    #[test]
    fn recovers_from_torn_write() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;
        for sequence in 1..=5 {
            c.submit("client", "a", sequence, &format!("key{sequence}=value{sequence}"))?;
        }
        c.heartbeat("a")?;

        // Crash c and tear its last write.
        c.stop("c");
        let segment = std::fs::read_dir(c.dir("c"))?
            .map(|dirent| dirent.map(|d| d.path()))
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
            .max()
            .expect("no segment");
        let mut bytes = std::fs::read(&segment)?;
        let footer = bytes.iter().rposition(|b| *b != 0).expect("empty segment");
        bytes[footer] ^= 0xff;
        std::fs::write(&segment, bytes)?;

        // The node discards the torn segment and catches up from the leader.
        c.start("c")?;
        assert_eq!(c.status("c").log.last_index, 0);
        c.connect()?;
        for _ in 0..3 {
            c.heartbeat("a")?;
        }
        c.assert_converged("a");
        assert_eq!(c.status("c").term, 1);
        Ok(())
    }
}
