use super::super::{decode_records, Chunk, Envelope, Index, Message, SnapshotReceiver};
use super::{Candidate, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::errdata;
use crate::error::{Error, Result};

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};

/// A follower replicates log entries from a leader. Without a leader, it polls
/// its peers with a pre-vote when its election timer runs out, and only
/// becomes a candidate once a quorum says it could win.
#[derive(Debug)]
pub struct Follower {
    /// The leader, or None if just initialized or the leader was lost.
    pub(super) leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    pub(super) leader_seen: Ticks,
    /// The leader_seen timeout before polling for an election.
    pub(super) election_timeout: Ticks,
    /// The node we voted for in the current term, if any.
    pub(super) voted_for: Option<NodeID>,
    /// An ongoing pre-vote, if any.
    pub(super) prevote: Option<PreVote>,
    /// A snapshot being received from the leader, if any.
    pub(super) receiver: Option<SnapshotReceiver>,
}

/// A pre-vote poll for the given term.
#[derive(Debug)]
pub struct PreVote {
    pub(super) term: Term,
    pub(super) votes: HashSet<NodeID>,
}

impl Follower {
    /// Creates a new follower role.
    pub(super) fn new(leader: Option<NodeID>, voted_for: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, voted_for, leader_seen: 0, election_timeout, prevote: None, receiver: None }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();
        if let Some(leader) = &self.role.leader {
            assert_ne!(leader, &self.id, "Can't follow self");
            assert_ne!(self.term, 0, "Followers with leaders can't have term 0");
        }
        debug_assert_eq!(self.role.voted_for, self.log.get_term().1, "Vote does not match log");
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    pub(super) fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Apply any pending log entries, so that we're caught up if we win.
        self.maybe_apply()?;
        if let Some(receiver) = self.role.receiver.take() {
            receiver.discard()?;
        }
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions into a follower, either a leaderless follower in a new
    /// term or following a leader in the current term.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "Term regression {} -> {}", self.term, term);
        if let Some(receiver) = self.role.receiver.take() {
            receiver.discard()?;
        }
        if let Some(leader) = leader {
            assert_eq!(self.role.leader, None, "Already have leader in term");
            assert_eq!(term, self.term, "Can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.voted_for.take(), self.role.election_timeout);
        } else {
            assert_ne!(term, self.term, "Can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, None, self.gen_election_timeout());
        }
        Ok(self)
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
            // follower in it and step the message. If the message is an Append
            // or InstallSnapshot from the leader, stepping it will follow it.
            if msg.term > self.term {
                return self.into_follower(None, msg.term)?.step(msg);
            }
        }

        // Messages from the leader: follow it if we don't have one yet.
        if matches!(msg.message, Message::Append { .. } | Message::InstallSnapshot { .. }) {
            match self.role.leader.clone() {
                None => {
                    let from = msg.from.clone();
                    return self.into_follower(Some(from), msg.term)?.step(msg);
                }
                Some(leader) if leader != msg.from => {
                    warn!("Ignoring message from {} while following {leader} in term {}", msg.from, self.term);
                    return Ok(self.into());
                }
                Some(_) => {
                    self.role.leader_seen = 0;
                    self.role.prevote = None;
                }
            }
        }

        match msg.message {
            Message::ConnectRequest { cluster, client: false } => {
                let leader = self.role.leader.clone();
                self.accept_peer(&msg.from, &cluster, leader)?;
            }

            // Only the leader registers clients. Point them to it.
            Message::ConnectRequest { client: true, .. } => {
                self.refuse_client(&msg.from, self.role.leader.clone())?;
            }

            Message::ConnectResponse { success, .. } => {
                self.peer_accepted(&msg.from, success);
            }

            // Grant pre-votes only if we've lost our leader too, and the
            // poller's log is at least as up-to-date as ours. The vote isn't
            // recorded.
            Message::PreVote { term, last_index, last_term } => {
                let vote = self.role.leader.is_none() && term > self.term && self.is_up_to_date(last_index, last_term);
                debug!("Pre-vote for {} in term {term}: {vote}", msg.from);
                self.send(&msg.from, Message::PreVoteResponse { term, vote })?;
            }

            Message::PreVoteResponse { term, vote: true } => {
                let voter = self.membership.is_voter(&msg.from);
                if let Some(prevote) = self.role.prevote.as_mut().filter(|p| p.term == term && voter) {
                    prevote.votes.insert(msg.from);
                    if prevote.votes.len() >= self.membership.quorum_size() {
                        return self.into_candidate()?.maybe_win();
                    }
                }
            }

            // A candidate in this term is requesting our vote.
            Message::Campaign { last_index, last_term, transfer } => {
                let vote = self.can_vote(&msg.from, last_index, last_term, transfer);
                if vote {
                    info!("Voting for {} in term {} election", msg.from, self.term);
                    self.log.set_term(self.term, Some(msg.from.clone()))?;
                    self.role.voted_for = Some(msg.from.clone());
                    self.role.leader_seen = 0;
                }
                self.send(&msg.from, Message::CampaignResponse { vote })?;
            }

            // Late or rejected votes, e.g. after losing an election. Ignore them.
            Message::PreVoteResponse { .. } | Message::CampaignResponse { .. } => {}

            Message::Append { base_index, base_term, commit_index, entries } => {
                self.append(&msg.from, base_index, base_term, commit_index, &entries)?;
            }

            Message::InstallSnapshot { index, term, offset, data, done } => {
                self.install_snapshot(&msg.from, index, term, offset, data, done)?;
            }

            // Clients must submit requests to the leader.
            Message::ClientRequest { sequence, .. } => {
                self.send(&msg.from, Message::ClientResponse { sequence, response: Err(Error::Abort) })?;
            }
            Message::UnregisterRequest => {
                self.send(&msg.from, Message::UnregisterResponse { response: Err(Error::Abort) })?;
            }
            Message::JoinRequest { .. } => {
                self.send(&msg.from, Message::JoinResponse { response: Err(Error::Abort) })?;
            }

            Message::StatusRequest => {
                let status = self.status("follower", self.role.leader.clone(), BTreeMap::new());
                self.send(&msg.from, Message::StatusResponse { status })?;
            }

            // We're not a leader in this term, so we shouldn't see these.
            Message::AppendResponse { .. }
            | Message::InstallSnapshotResponse { .. }
            | Message::ClientResponse { .. }
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

        self.role.leader_seen = self.role.leader_seen.saturating_add(1);
        if self.role.leader_seen < self.role.election_timeout {
            return Ok(self.into());
        }
        self.role.leader_seen = 0;
        self.role.election_timeout = self.gen_election_timeout();
        if let Some(leader) = self.role.leader.take() {
            info!("Lost leader {leader} in term {}", self.term);
        }
        self.role.prevote = None;
        if self.membership.is_voter(&self.id) && self.membership.can_reach_quorum() {
            return self.prevote();
        }
        Ok(self.into())
    }

    /// Polls the voters with a pre-vote for the next term. Becomes a candidate
    /// right away if our own vote is a quorum.
    pub(super) fn prevote(mut self) -> Result<Node> {
        let term = self.term + 1;
        let votes = HashSet::from([self.id.clone()]);
        if votes.len() >= self.membership.quorum_size() {
            return self.into_candidate()?.maybe_win();
        }
        info!("Starting pre-vote for term {term}");
        let (last_index, last_term) = self.log.get_last_index();
        self.role.prevote = Some(PreVote { term, votes });
        self.broadcast(Message::PreVote { term, last_index, last_term })?;
        Ok(self.into())
    }

    /// Returns true if we can vote for a candidate in the current term.
    fn can_vote(&self, candidate: &str, last_index: Index, last_term: Term, transfer: bool) -> bool {
        if !self.membership.is_voter(candidate) {
            warn!("Refusing vote for non-voter {candidate}");
            return false;
        }
        if self.role.leader.is_some() && !transfer {
            return false;
        }
        if self.role.voted_for.as_deref().is_some_and(|voted_for| voted_for != candidate) {
            return false;
        }
        self.is_up_to_date(last_index, last_term)
    }

    /// Appends entries from the leader, if the base entry matches our log, and
    /// commits and applies entries up to the leader's commit index.
    fn append(
        &mut self,
        from: &str,
        base_index: Index,
        base_term: Term,
        commit_index: Index,
        entries: &[u8],
    ) -> Result<()> {
        // Entries below the snapshot are already applied, so the base can't
        // be checked and doesn't need to be.
        let (snapshot_index, _) = self.log.get_snapshot_index();
        if base_index > snapshot_index && !self.log.has(base_index, base_term) {
            debug!("Rejecting append at base {base_index}/{base_term}");
            return self.reject_append(from, base_index);
        }
        let entries = match decode_records(entries) {
            Ok(entries) if entries.first().map_or(true, |e| e.index == base_index + 1) => entries,
            Ok(entries) => {
                warn!("Rejecting append at base {base_index} starting at {:?}", entries.first().map(|e| e.index));
                return self.reject_append(from, base_index);
            }
            Err(err) => {
                warn!("Rejecting undecodable append from {from}: {err}");
                return self.reject_append(from, base_index);
            }
        };

        let matched = base_index + entries.len() as Index;
        let last_index = self.log.splice(entries)?;
        self.send(from, Message::AppendResponse { success: true, index: matched, last_index })?;

        let commit_index = commit_index.min(matched);
        if commit_index > self.log.get_commit_index().0 {
            self.log.commit(commit_index)?;
            self.maybe_apply()?;
        }
        Ok(())
    }

    fn reject_append(&self, to: &str, base_index: Index) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        self.send(to, Message::AppendResponse { success: false, index: base_index, last_index })
    }

    fn reject_snapshot(&self, to: &str, index: Index, offset: u64) -> Result<()> {
        self.send(to, Message::InstallSnapshotResponse { index, offset, success: false })
    }

    /// Receives a snapshot chunk from the leader. Chunks must arrive in order,
    /// otherwise the leader is told which offset to resume from. Once the last
    /// chunk arrives, the snapshot is installed and the log reset to it.
    fn install_snapshot(
        &mut self,
        from: &str,
        index: Index,
        term: Term,
        offset: u64,
        data: Chunk,
        done: bool,
    ) -> Result<()> {
        if offset == 0 {
            if let Some(receiver) = self.role.receiver.take() {
                receiver.discard()?;
            }
            self.role.receiver = Some(self.snapshots.receiver(index, term)?);
        }
        let Some(receiver) = self.role.receiver.as_mut().filter(|r| r.snapshot() == (index, term)) else {
            debug!("Rejecting snapshot chunk at {offset} without transfer");
            return self.reject_snapshot(from, index, 0);
        };
        if !receiver.write(offset, data.as_bytes())? {
            let expect = receiver.offset();
            debug!("Rejecting snapshot chunk at {offset}, expected {expect}");
            return self.reject_snapshot(from, index, expect);
        }
        let next = receiver.offset();

        if done {
            let Some(receiver) = self.role.receiver.take() else {
                return errdata!("snapshot receiver vanished");
            };
            if index <= self.log.get_commit_index().0 {
                debug!("Discarding snapshot at index {index}, already committed");
                receiver.discard()?;
            } else {
                let Some((index, term)) = self.snapshots.install(receiver, &mut self.machine)? else {
                    return self.reject_snapshot(from, index, 0);
                };
                self.log.reset(index, term)?;
                let cluster = self.machine.cluster().clone();
                self.membership.set_record(cluster.clone());
                self.log.set_cluster(cluster)?;
                info!("Installed snapshot at index {index} term {term}");
            }
        }
        self.send(from, Message::InstallSnapshotResponse { index, offset: next, success: true })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_options, Cluster};
    use super::*;
    use pretty_assertions::assert_eq;

    fn campaign(from: &str, to: &str, term: Term, last: (Index, Term)) -> Envelope {
        let (last_index, last_term) = last;
        Envelope {
            from: from.into(),
            to: to.into(),
            term,
            message: Message::Campaign { last_index, last_term, transfer: false },
        }
    }

    fn votes(msgs: Vec<Envelope>) -> Vec<bool> {
        msgs.into_iter()
            .filter_map(|msg| match msg.message {
                Message::CampaignResponse { vote } => Some(vote),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn votes_once_per_term() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        let last = (c.status("c").log.last_index, 1);

        assert_eq!(votes(c.step(campaign("b", "c", 2, last))?), vec![true]);
        assert_eq!(votes(c.step(campaign("a", "c", 2, last))?), vec![false]);
        assert_eq!(votes(c.step(campaign("b", "c", 2, last))?), vec![true]);
        assert_eq!(c.status("c").term, 2);

        // The vote is durable across restarts.
        c.stop("c");
        c.start("c")?;
        assert_eq!(votes(c.step(campaign("a", "c", 2, last))?), vec![false]);
        Ok(())
    }

    #[test]
    fn refuses_vote_for_stale_log() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        assert_eq!(votes(c.step(campaign("b", "c", 2, (1, 1)))?), vec![false]);
        assert_eq!(c.status("c").term, 2);
        assert_eq!(c.status("c").leader, None);
        Ok(())
    }

    #[test]
    fn rejects_append_without_base() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        let last_index = c.status("c").log.last_index;
        let msgs = c.step(Envelope {
            from: "a".into(),
            to: "c".into(),
            term: 1,
            message: Message::Append { base_index: 10, base_term: 1, commit_index: 10, entries: vec![] },
        })?;
        assert_eq!(
            msgs.into_iter().map(|msg| msg.message).collect::<Vec<_>>(),
            vec![Message::AppendResponse { success: false, index: 10, last_index }]
        );
        Ok(())
    }

    #[test]
    fn rejects_stale_term() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        let msgs = c.step(Envelope {
            from: "b".into(),
            to: "c".into(),
            term: 0,
            message: Message::PreVote { term: 1, last_index: 0, last_term: 0 },
        })?;
        assert_eq!(
            msgs.into_iter().map(|msg| (msg.term, msg.message)).collect::<Vec<_>>(),
            vec![(1, Message::PreVoteResponse { term: 1, vote: false })]
        );
        Ok(())
    }

    #[test]
    fn drops_messages_from_non_members() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        let msgs = c.step(campaign("x", "c", 5, (100, 5)))?;
        assert!(msgs.is_empty());
        assert_eq!(c.status("c").term, 1);
        Ok(())
    }

    #[test]
    fn aborts_client_requests() -> Result<()> {
        let mut c = Cluster::new(&["a", "b", "c"], test_options())?;
        c.elect("a")?;
        let response = c.register("client", "b")?;
        assert!(matches!(response, Message::ConnectResponse { success: false, leader: Some(ref l), .. } if l == "a"));
        assert_eq!(
            c.submit("client", "b", 1, "x=1")?,
            vec![Message::ClientResponse { sequence: 1, response: Err(Error::Abort) }]
        );
        Ok(())
    }
}
