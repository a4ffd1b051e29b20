use super::super::{
    Applied, Command, Entry, Envelope, Index, Message, Mode, NodeRecord, NodeRole, Progress, Sequence, Status,
};
use super::{quorum_value, Follower, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::{errdata, errinput};

use itertools::Itertools as _;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A leader serves client requests and replicates the log to followers.
/// If the leader loses leadership, all client requests are aborted.
#[derive(Debug)]
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Pending client writes, by log index.
    writes: HashMap<Index, Write>,
    /// Pending client registrations, by log index.
    registrations: HashMap<Index, NodeID>,
    /// Pending session removals, by log index.
    unregistrations: HashMap<Index, NodeID>,
    /// Pending joins, by log index, with the client that requested them.
    joins: HashMap<Index, NodeID>,
    /// Registered clients connected to us. They receive cluster record
    /// publications.
    clients: HashSet<NodeID>,
    /// Whether our noop has been applied. Until then, we can't know which
    /// sessions and cluster record are current, so clients are refused.
    pub(super) term_started: bool,
    /// The index of our pending cluster record proposal or join, if any. Only
    /// one may be in flight at a time.
    pending_config: Option<Index>,
    /// Whether the cluster record changed while a proposal was pending.
    config_dirty: bool,
    /// Number of ticks since last heartbeat.
    since_heartbeat: Ticks,
}

/// A pending client write.
#[derive(Debug)]
struct Write {
    from: NodeID,
    sequence: Sequence,
}

impl Leader {
    /// Creates a new leader role.
    pub(super) fn new(peers: Vec<NodeID>, last_index: Index) -> Self {
        Self {
            progress: peers.into_iter().map(|peer| (peer, Progress::new(last_index))).collect(),
            writes: HashMap::new(),
            registrations: HashMap::new(),
            unregistrations: HashMap::new(),
            joins: HashMap::new(),
            clients: HashSet::new(),
            term_started: false,
            pending_config: None,
            config_dirty: false,
            since_heartbeat: 0,
        }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();
        assert_ne!(self.term, 0, "Leaders can't have term 0");
        debug_assert_eq!(Some(&self.id), self.log.get_term().1.as_ref(), "Log vote does not match self");
        assert!(self.role.progress.keys().all(|id| *id != self.id), "Leader tracks own progress");
    }

    /// Transitions the leader into a follower. This can only happen if we
    /// discover a new term, so we become a leaderless follower. Pending client
    /// requests are aborted, and must be retried.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term, "Can only become follower in later term");
        info!("Discovered new term {term}, stepping down");

        let writes = std::mem::take(&mut self.role.writes);
        for (_, write) in writes.into_iter().sorted_by_key(|(index, _)| *index) {
            let response = Err(Error::Abort);
            self.send(&write.from, Message::ClientResponse { sequence: write.sequence, response })?;
        }
        let registrations = std::mem::take(&mut self.role.registrations);
        for (_, client) in registrations.into_iter().sorted_by_key(|(index, _)| *index) {
            self.refuse_client(&client, None)?;
        }
        let unregistrations = std::mem::take(&mut self.role.unregistrations);
        for (_, client) in unregistrations.into_iter().sorted_by_key(|(index, _)| *index) {
            self.send(&client, Message::UnregisterResponse { response: Err(Error::Abort) })?;
        }
        let joins = std::mem::take(&mut self.role.joins);
        for (_, client) in joins.into_iter().sorted_by_key(|(index, _)| *index) {
            self.send(&client, Message::JoinResponse { response: Err(Error::Abort) })?;
        }

        self.term = term;
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, None, election_timeout)))
    }

    /// Processes a message.
    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        if msg.message.is_raft() {
            if self.drop_message(&msg)? {
                return Ok(self.into());
            }
            // If we receive a message for a future term, become a leaderless
            // follower in it and step the message.
            if msg.term > self.term {
                return self.into_follower(msg.term)?.step(msg);
            }
        }

        match msg.message {
            Message::ConnectRequest { cluster, client: false } => {
                let leader = Some(self.id.clone());
                if self.accept_peer(&msg.from, &cluster, leader)? {
                    self.maybe_propose_config()?;
                }
            }

            // Register a client session. The client is answered once the
            // registration is applied, with its session's sequence numbers.
            Message::ConnectRequest { cluster, client: true } => {
                if !self.role.term_started || cluster != self.membership.record().name {
                    self.refuse_client(&msg.from, Some(self.id.clone()))?;
                    return Ok(self.into());
                }
                let command = Command::Register { name: msg.from.clone() };
                let index = self.propose(Entry::internal(self.term, command.encode()?))?;
                self.role.registrations.insert(index, msg.from);
                self.maybe_commit_and_apply()?;
            }

            Message::ConnectResponse { success, .. } => {
                if self.peer_accepted(&msg.from, success) {
                    self.maybe_propose_config()?;
                }
            }

            // We have a leader, so pre-votes and votes are refused.
            Message::PreVote { term, .. } => {
                self.send(&msg.from, Message::PreVoteResponse { term, vote: false })?;
            }
            Message::Campaign { .. } => {
                self.send(&msg.from, Message::CampaignResponse { vote: false })?;
            }
            Message::PreVoteResponse { .. } | Message::CampaignResponse { .. } => {}

            // There can't be two leaders in the same term.
            Message::Append { .. } | Message::InstallSnapshot { .. } => {
                warn!("Ignoring {msg:?} from another leader in term {}", self.term);
            }

            // A follower appended our log entries. Record its progress, commit
            // and apply any newly replicated entries, and send more entries if
            // it is still behind.
            Message::AppendResponse { success: true, index, .. } => {
                let Some(progress) = self.role.progress.get_mut(&msg.from) else { return Ok(self.into()) };
                if progress.advance(index) {
                    self.maybe_commit_and_apply()?;
                }
                let (last_index, _) = self.log.get_last_index();
                if self
                    .role
                    .progress
                    .get(&msg.from)
                    .is_some_and(|p| matches!(p.mode, Mode::Replicate) && p.next <= last_index)
                {
                    self.send_log(&msg.from)?;
                }
            }

            // A follower rejected entries because the base entry didn't match
            // its log. Back off and probe an earlier base.
            Message::AppendResponse { success: false, index, last_index } => {
                let regressed = match self.role.progress.get_mut(&msg.from) {
                    Some(progress) if matches!(progress.mode, Mode::Replicate) => progress.regress(index, last_index),
                    _ => false,
                };
                if regressed {
                    debug!("Probing {} from index {}", msg.from, index);
                    self.send_log(&msg.from)?;
                }
            }

            Message::InstallSnapshotResponse { index, offset, success } => {
                self.snapshot_response(&msg.from, index, offset, success)?;
            }

            Message::ClientRequest { sequence, acknowledge, command } => {
                self.client_request(&msg.from, sequence, acknowledge, command)?;
            }

            Message::UnregisterRequest => self.unregister(&msg.from)?,

            Message::JoinRequest { node } => self.join(&msg.from, node)?,

            Message::StatusRequest => {
                let status = self.leader_status();
                self.send(&msg.from, Message::StatusResponse { status })?;
            }

            Message::ClientResponse { .. }
            | Message::UnregisterResponse { .. }
            | Message::JoinResponse { .. }
            | Message::Publish { .. }
            | Message::StatusResponse { .. } => warn!("Received unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    pub(super) fn tick(mut self) -> Result<Node> {
        self.assert();

        // Resume stalled snapshot transfers.
        let timeout = self.opts.snapshot_timeout;
        let stalled: Vec<NodeID> = self
            .role
            .progress
            .iter_mut()
            .filter_map(|(id, progress)| match &mut progress.mode {
                Mode::Snapshot(sender) => sender.tick(timeout).then(|| id.clone()),
                Mode::Replicate => None,
            })
            .sorted()
            .collect();
        for peer in stalled {
            self.send_snapshot(&peer)?;
        }

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Sends the pending log entries, or an empty append if caught up, to all
    /// peers. This asserts leadership and propagates the commit index.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.role.progress.keys().cloned().sorted().collect_vec() {
            self.send_log(&peer)?;
        }
        Ok(())
    }

    /// Proposes an entry by appending it to the log. It is sent to peers that
    /// have acknowledged all previous entries, while other peers receive it in
    /// a batch with the next response or heartbeat. The caller must call
    /// maybe_commit_and_apply() afterwards, which commits it right away if we
    /// are the only voter.
    pub(super) fn propose(&mut self, entry: Entry) -> Result<Index> {
        let index = self.log.append(entry)?;
        let peers = self
            .role
            .progress
            .iter()
            .filter(|(_, progress)| progress.next == index && matches!(progress.mode, Mode::Replicate))
            .map(|(id, _)| id.clone())
            .sorted()
            .collect_vec();
        for peer in peers {
            self.send_log(&peer)?;
        }
        Ok(index)
    }

    /// Commits any new log entries that have been replicated to a quorum, and
    /// applies them to the state machine.
    pub(super) fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        let (last_index, _) = self.log.get_last_index();
        let matched = self
            .membership
            .record()
            .voters()
            .into_iter()
            .map(|id| match id == self.id {
                true => last_index,
                false => self.role.progress.get(&id).map_or(0, |p| p.matched),
            })
            .collect_vec();
        let (old_index, _) = self.log.get_commit_index();
        if matched.is_empty() {
            return Ok(old_index);
        }
        let commit_index = quorum_value(matched);
        if commit_index <= old_index {
            return Ok(old_index);
        }

        // We can only safely commit an entry from our own term (see figure 8
        // in the Raft paper).
        match self.log.term_at(commit_index) {
            Some(term) if term == self.term => {}
            Some(_) => return Ok(old_index),
            None => return errdata!("commit index {commit_index} missing"),
        }
        self.log.commit(commit_index)?;
        self.maybe_apply_with(|node, applied| node.on_applied(applied))?;
        Ok(commit_index)
    }

    /// Handles an applied entry: answers clients and reacts to internal
    /// commands.
    fn on_applied(&mut self, applied: Applied) -> Result<()> {
        match &applied.command {
            Some(Command::Noop) if applied.term == self.term => {
                info!("Started term {}", self.term);
                self.role.term_started = true;
                self.maybe_propose_config()?;
            }

            Some(Command::Config(_) | Command::Join(_)) => {
                if self.role.pending_config == Some(applied.index) {
                    self.role.pending_config = None;
                }
                self.sync_progress();
                let cluster = self.membership.record().clone();
                for client in self.role.clients.iter().sorted() {
                    self.send(client, Message::Publish { cluster: cluster.clone() })?;
                }
                if let Some(client) = self.role.joins.remove(&applied.index) {
                    info!("Applied join at index {}", applied.index);
                    self.send(&client, Message::JoinResponse { response: Ok(cluster) })?;
                }
                if self.role.config_dirty {
                    self.role.config_dirty = false;
                    self.maybe_propose_config()?;
                }
            }

            Some(Command::Register { .. }) => {
                if let Some(client) = self.role.registrations.remove(&applied.index) {
                    let (sequence, acknowledge) = self
                        .machine
                        .sessions()
                        .find(&client)
                        .map_or((0, 0), |session| (session.last_sequence, session.last_acknowledge));
                    info!("Registered client {client} at sequence {sequence}");
                    self.send(
                        &client,
                        Message::ConnectResponse {
                            success: applied.response.success,
                            leader: Some(self.id.clone()),
                            cluster: self.membership.record().clone(),
                            sequence,
                            acknowledge,
                        },
                    )?;
                    self.role.clients.insert(client);
                }
            }

            Some(Command::Unregister { .. }) => {
                if let Some(client) = self.role.unregistrations.remove(&applied.index) {
                    info!("Unregistered client {client}");
                    self.role.clients.remove(&client);
                    let response = applied.response.clone().into_result().map(|_| ());
                    self.send(&client, Message::UnregisterResponse { response })?;
                }
            }

            _ => {}
        }

        if let Some(write) = self.role.writes.remove(&applied.index) {
            let response = applied.response.into_result();
            self.send(&write.from, Message::ClientResponse { sequence: write.sequence, response })?;
        }
        Ok(())
    }

    /// Proposes our view of the cluster record, if it differs from the applied
    /// record. Only one proposal is in flight at a time. Changes made while one
    /// is pending are proposed once it applies.
    fn maybe_propose_config(&mut self) -> Result<()> {
        if !self.role.term_started {
            return Ok(());
        }
        if self.role.pending_config.is_some() {
            self.role.config_dirty = true;
            return Ok(());
        }
        let view = self.membership.leader_view();
        if &view == self.membership.record() {
            return Ok(());
        }
        debug!("Proposing cluster record {view:?}");
        let index = self.propose(Entry::internal(self.term, Command::Config(view).encode()?))?;
        self.role.pending_config = Some(index);
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Removes a client's session. Unknown clients are answered right away.
    fn unregister(&mut self, from: &str) -> Result<()> {
        if !self.role.term_started {
            return self.send(from, Message::UnregisterResponse { response: Err(Error::Abort) });
        }
        let Some(client_id) = self.machine.sessions().find(from).map(|s| s.client_id) else {
            return self.send(from, Message::UnregisterResponse { response: Ok(()) });
        };
        let index = self.propose(Entry::internal(self.term, Command::Unregister { client_id }.encode()?))?;
        self.role.unregistrations.insert(index, from.to_string());
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Adds a node to the cluster, or updates a member's group and transports.
    /// The join takes the pending config slot, so it's aborted while another
    /// change is in flight. A member's role can't be changed.
    fn join(&mut self, from: &str, mut node: NodeRecord) -> Result<()> {
        if !self.role.term_started || self.role.pending_config.is_some() {
            return self.send(from, Message::JoinResponse { response: Err(Error::Abort) });
        }
        let invalid = match self.membership.record().get(&node.name) {
            _ if node.name.is_empty() => Some("node name can't be empty".to_string()),
            _ if matches!(node.role, NodeRole::Leader | NodeRole::Client) => {
                Some(format!("node {} can't join as {:?}", node.name, node.role))
            }
            Some(existing) if existing.role != node.role => {
                Some(format!("node {} is already a member as {:?}", node.name, existing.role))
            }
            Some(existing) if existing.group == node.group && existing.transports == node.transports => {
                let response = Ok(self.membership.record().clone());
                return self.send(from, Message::JoinResponse { response });
            }
            _ => None,
        };
        if let Some(message) = invalid {
            return self.send(from, Message::JoinResponse { response: Err(Error::InvalidInput(message)) });
        }

        info!("Node {} joining as {:?}", node.name, node.role);
        node.connected = false;
        let index = self.propose(Entry::internal(self.term, Command::Join(node).encode()?))?;
        self.role.pending_config = Some(index);
        self.role.joins.insert(index, from.to_string());
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Adds and removes follower progress to match the applied cluster record.
    fn sync_progress(&mut self) {
        let (last_index, _) = self.log.get_last_index();
        let peers = self.membership.peers();
        self.role.progress.retain(|id, _| peers.contains(id));
        for peer in peers {
            self.role.progress.entry(peer).or_insert_with(|| Progress::new(last_index));
        }
    }

    /// Proposes a client write. Unknown clients and oversized commands are
    /// rejected right away.
    fn client_request(&mut self, from: &str, sequence: Sequence, acknowledge: Sequence, command: Vec<u8>) -> Result<()> {
        let Some(session) = self.machine.sessions().find(from) else {
            let response = errinput!("client {from} has no session");
            return self.send(from, Message::ClientResponse { sequence, response });
        };
        let entry = Entry::user(0, self.term, session.client_id, sequence, acknowledge, command);
        if let Err(err) = self.log.check_size(&entry) {
            return self.send(from, Message::ClientResponse { sequence, response: Err(err) });
        }
        let index = self.propose(entry)?;
        self.role.writes.insert(index, Write { from: from.to_string(), sequence });
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Handles a snapshot chunk response. Once every chunk is acknowledged,
    /// the follower resumes log replication after the snapshot.
    fn snapshot_response(&mut self, from: &str, index: Index, offset: u64, success: bool) -> Result<()> {
        let Some(progress) = self.role.progress.get_mut(from) else { return Ok(()) };
        let Mode::Snapshot(sender) = &mut progress.mode else {
            debug!("Ignoring snapshot response from {from} without transfer");
            return Ok(());
        };
        if sender.snapshot().0 != index {
            return Ok(());
        }
        if !success {
            sender.rewind(offset);
            return self.send_snapshot(from);
        }
        sender.ack(offset);
        if !sender.is_done() {
            return self.send_snapshot(from);
        }

        info!("Sent snapshot at index {index} to {from}");
        progress.mode = Mode::Replicate;
        progress.next = index + 1;
        if progress.advance(index) {
            self.maybe_commit_and_apply()?;
        }
        self.send_log(from)
    }

    /// Sends pending log entries to a peer, starting at its next index. If
    /// the entries have been compacted away, starts a snapshot transfer.
    fn send_log(&mut self, peer: &str) -> Result<()> {
        let Some(progress) = self.role.progress.get_mut(peer) else { return Ok(()) };
        if let Mode::Snapshot(_) = progress.mode {
            return self.send_snapshot(peer);
        }

        let base_index = progress.next - 1;
        let Some(base_term) = self.log.term_at(base_index) else {
            let Some(sender) = self.snapshots.sender()? else {
                return errdata!("no snapshot for {peer} at base index {base_index}");
            };
            info!("Sending snapshot at index {} to {peer}", sender.snapshot().0);
            progress.mode = Mode::Snapshot(sender);
            return self.send_snapshot(peer);
        };

        // The message is sent to another thread, so the mapped records are
        // copied into it.
        let (chunks, last) = self.log.raw_range(progress.next, self.opts.max_append_bytes);
        let entries = chunks.concat();
        let (commit_index, _) = self.log.get_commit_index();
        debug!("Replicating {}..={last} to {peer}", base_index + 1);
        self.send(peer, Message::Append { base_index, base_term, commit_index, entries })
    }

    /// Sends snapshot chunks to a peer, as many as the transfer window allows.
    fn send_snapshot(&mut self, peer: &str) -> Result<()> {
        let Some(Progress { mode: Mode::Snapshot(sender), .. }) = self.role.progress.get_mut(peer) else {
            return Ok(());
        };
        let (index, term) = sender.snapshot();
        let mut chunks = Vec::new();
        while let Some(chunk) = sender.next_chunk()? {
            chunks.push(chunk);
        }
        for (offset, data, done) in chunks {
            self.send(peer, Message::InstallSnapshot { index, term, offset, data, done })?;
        }
        Ok(())
    }

    /// Records a lost connection to a peer or client. A lost peer changes the
    /// cluster record's connectivity.
    pub(super) fn leader_disconnected(&mut self, peer: &str) -> Result<()> {
        self.role.clients.remove(peer);
        if self.membership.set_connected(peer, false) {
            info!("Disconnected from {peer}");
            self.maybe_propose_config()?;
        }
        Ok(())
    }

    /// Generates a status report, including follower match indexes.
    pub(super) fn leader_status(&self) -> Status {
        let (last_index, _) = self.log.get_last_index();
        let match_index = self
            .role
            .progress
            .iter()
            .map(|(id, progress)| (id.clone(), progress.matched))
            .chain(std::iter::once((self.id.clone(), last_index)))
            .collect::<BTreeMap<_, _>>();
        self.status("leader", Some(self.id.clone()), match_index)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_options, Cluster};
    use super::super::Options;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rejects_unregistered_client() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        assert_eq!(
            c.submit("client", "a", 1, "x=1")?,
            vec![Message::ClientResponse {
                sequence: 1,
                response: Err(Error::InvalidInput("client client has no session".into()))
            }]
        );
        Ok(())
    }

    #[test]
    fn rejects_oversized_command() -> Result<()> {
        let opts = Options { segment_size: 1024, ..test_options() };
        let mut c = Cluster::new(&["a", "b", "c"], opts)?;
        c.elect("a")?;
        c.register("client", "a")?;
        let last_index = c.status("a").log.last_index;

        let command = format!("x={}", "y".repeat(2000));
        let responses = c.submit("client", "a", 1, &command)?;
        assert!(matches!(
            responses.as_slice(),
            [Message::ClientResponse { sequence: 1, response: Err(Error::InvalidInput(_)) }]
        ));
        assert_eq!(c.status("a").log.last_index, last_index);
        Ok(())
    }

    #[test]
    fn deterministic_failures_are_responses() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;
        assert_eq!(
            c.submit("client", "a", 1, "!bad command")?,
            vec![Message::ClientResponse {
                sequence: 1,
                response: Err(Error::InvalidInput("bad command".into()))
            }]
        );
        Ok(())
    }

    #[test]
    fn refuses_clients_until_term_started() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;

        // Win an election with b's vote, without delivering the noop.
        for _ in 0..=c.opts.election_timeout_range.end {
            let msgs = c.tick_raw("a")?;
            if let Some(Message::PreVote { term, .. }) = msgs.into_iter().map(|msg| msg.message).next() {
                let message = Message::PreVoteResponse { term, vote: true };
                c.step(Envelope { from: "b".into(), to: "a".into(), term: 0, message })?;
                break;
            }
        }
        assert_eq!(c.status("a").role, "candidate");
        let message = Message::CampaignResponse { vote: true };
        c.step(Envelope { from: "b".into(), to: "a".into(), term: 1, message })?;
        assert_eq!(c.status("a").role, "leader");

        let message = Message::ConnectRequest { cluster: "test".into(), client: true };
        let msgs = c.step(Envelope { from: "client".into(), to: "a".into(), term: 0, message })?;
        assert!(matches!(
            msgs.as_slice(),
            [Envelope { message: Message::ConnectResponse { success: false, leader: Some(_), .. }, .. }]
        ));

        // Once the noop commits, the client can register.
        c.heartbeat("a")?;
        let response = c.register("client", "a")?;
        assert!(matches!(response, Message::ConnectResponse { success: true, sequence: 0, .. }));
        Ok(())
    }

    #[test]
    fn publishes_cluster_record() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;
        c.stop("c");
        c.deliver()?;

        let published: Vec<_> = std::mem::take(&mut c.clients)
            .into_iter()
            .filter_map(|msg| match msg.message {
                Message::Publish { cluster } => Some(cluster),
                _ => None,
            })
            .collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].get("c").map(|n| n.connected), Some(false));
        Ok(())
    }

    #[test]
    fn unregister_frees_client_id() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("c1", "a")?;
        c.register("c2", "a")?;
        c.submit("c1", "a", 1, "x=1")?;

        c.client_send("c1", "a", Message::UnregisterRequest)?;
        let msgs: Vec<_> = c.take_client("c1").into_iter().map(|msg| msg.message).collect();
        assert_eq!(msgs, vec![Message::UnregisterResponse { response: Ok(()) }]);
        assert_eq!(c.status("a").sessions, 1);
        c.assert_converged("a");

        // The session is gone, so requests are rejected and unregistering
        // again is a noop.
        let responses = c.submit("c1", "a", 2, "x=2")?;
        assert!(matches!(
            responses.as_slice(),
            [Message::ClientResponse { sequence: 2, response: Err(Error::InvalidInput(_)) }]
        ));
        c.client_send("c1", "a", Message::UnregisterRequest)?;
        let msgs: Vec<_> = c.take_client("c1").into_iter().map(|msg| msg.message).collect();
        assert_eq!(msgs, vec![Message::UnregisterResponse { response: Ok(()) }]);

        // A new client gets the freed id, and re-registering c1 starts over.
        c.register("c3", "a")?;
        let response = c.register("c1", "a")?;
        assert!(matches!(response, Message::ConnectResponse { success: true, sequence: 0, .. }));
        let Node::Leader(n) = c.node("a") else { panic!("a is not leader") };
        assert_eq!(n.machine.sessions().find("c3").map(|s| s.client_id), Some(1));
        assert_eq!(n.machine.sessions().find("c2").map(|s| s.client_id), Some(2));
        assert_eq!(n.machine.sessions().find("c1").map(|s| s.client_id), Some(3));
        Ok(())
    }

    #[test]
    fn join_adds_node() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("admin", "a")?;
        c.submit("admin", "a", 1, "x=1")?;

        let node = NodeRecord::new("d", NodeRole::Promotable);
        c.client_send("admin", "a", Message::JoinRequest { node: node.clone() })?;
        let msgs: Vec<_> = c.take_client("admin").into_iter().map(|msg| msg.message).collect();
        let [Message::JoinResponse { response: Ok(cluster) }] = msgs.as_slice() else {
            panic!("unexpected join response {msgs:?}");
        };
        assert_eq!(cluster.get("d").map(|n| (n.role, n.connected)), Some((NodeRole::Promotable, false)));
        c.heartbeat("a")?;
        for id in ["a", "b", "c"] {
            assert!(c.node(id).cluster().get("d").is_some(), "d missing on {id}");
        }
        // The joined node has a session, like clients do.
        assert_eq!(c.status("a").sessions, 2);

        // Joining again is answered right away, and roles can't change.
        c.client_send("admin", "a", Message::JoinRequest { node: node.clone() })?;
        let msgs: Vec<_> = c.take_client("admin").into_iter().map(|msg| msg.message).collect();
        assert!(matches!(msgs.as_slice(), [Message::JoinResponse { response: Ok(_) }]));
        for role in [NodeRole::Peer, NodeRole::Leader] {
            let node = NodeRecord::new("d", role);
            c.client_send("admin", "a", Message::JoinRequest { node })?;
            let msgs: Vec<_> = c.take_client("admin").into_iter().map(|msg| msg.message).collect();
            assert!(matches!(msgs.as_slice(), [Message::JoinResponse { response: Err(Error::InvalidInput(_)) }]));
        }

        // The node starts with the record, and catches up.
        c.add_node("d", cluster.clone())?;
        c.heartbeat("a")?;
        c.heartbeat("a")?;
        c.assert_converged("a");
        assert_eq!(c.status("a").cluster.get("d").map(|n| n.connected), Some(true));
        assert_eq!(c.status("d").leader.as_deref(), Some("a"));
        Ok(())
    }

    #[test]
    fn join_aborts_while_config_pending() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("admin", "a")?;

        // Without b and c, the join can't commit, and holds the config slot.
        c.partition("b");
        c.partition("c");
        c.client_send("admin", "a", Message::JoinRequest { node: NodeRecord::new("d", NodeRole::Backup) })?;
        assert_eq!(c.take_client("admin"), vec![]);
        c.client_send("admin", "a", Message::JoinRequest { node: NodeRecord::new("e", NodeRole::Backup) })?;
        let msgs: Vec<_> = c.take_client("admin").into_iter().map(|msg| msg.message).collect();
        assert_eq!(msgs, vec![Message::JoinResponse { response: Err(Error::Abort) }]);

        c.heal();
        c.heartbeat("a")?;
        let msgs: Vec<_> = c.take_client("admin").into_iter().map(|msg| msg.message).collect();
        assert!(matches!(msgs.as_slice(), [Message::JoinResponse { response: Ok(_) }]));
        Ok(())
    }

    #[test]
    fn status_reports_progress() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        c.register("client", "a")?;
        c.submit("client", "a", 1, "x=1")?;
        let status = c.status("a");
        assert_eq!(status.role, "leader");
        assert_eq!(status.sessions, 1);
        let last_index = status.log.last_index;
        assert_eq!(
            status.match_index,
            BTreeMap::from([("a".to_string(), last_index), ("b".to_string(), last_index), ("c".to_string(), last_index)])
        );

        let msgs = c.step(Envelope { from: "client".into(), to: "a".into(), term: 0, message: Message::StatusRequest })?;
        assert_eq!(
            msgs.into_iter().map(|msg| msg.message).collect::<Vec<_>>(),
            vec![Message::StatusResponse { status: c.status("a") }]
        );
        Ok(())
    }
}
