use super::super::{Command, Entry, Envelope, Message};
use super::{Follower, Leader, Node, NodeID, RawNode, Role, Term, Ticks};
use crate::encoding::Value as _;
use crate::error::{Error, Result};

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};

/// A candidate is campaigning to become a leader.
#[derive(Debug)]
pub struct Candidate {
    /// Votes received (including our own).
    pub(super) votes: HashSet<NodeID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    pub(super) fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();
        assert_ne!(self.term, 0, "Candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "Candidate did not vote for self");
        debug_assert_eq!(Some(&self.id), self.log.get_term().1.as_ref(), "Log vote does not match self");
        assert!(self.role.election_duration < self.role.election_timeout, "Election timeout passed");
    }

    /// Transitions the candidate to a follower. We either lost the election and
    /// follow the winner, or we discovered a new term in which case we step
    /// into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            assert_eq!(term, self.term, "Can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            let voted_for = Some(self.id.clone());
            Ok(self.into_role(Follower::new(Some(leader), voted_for, election_timeout)))
        } else {
            assert!(term > self.term, "Can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let peers = self.membership.peers();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));

        // Propose an empty command when assuming leadership, to disambiguate
        // previous entries in the log. See section 5.4.2 in the Raft paper.
        // Appending it also replicates to all peers, which asserts leadership.
        let noop = Entry::internal(node.term, Command::Noop.encode()?);
        node.propose(noop)?;
        node.maybe_commit_and_apply()?;
        Ok(node)
    }

    /// Becomes leader if we have a quorum of votes.
    pub(super) fn maybe_win(self) -> Result<Node> {
        if self.role.votes.len() >= self.membership.quorum_size() {
            return Ok(self.into_leader()?.into());
        }
        Ok(self.into())
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
                return self.into_follower(msg.term, None)?.step(msg);
            }
        }

        match msg.message {
            Message::ConnectRequest { cluster, client: false } => {
                self.accept_peer(&msg.from, &cluster, None)?;
            }

            Message::ConnectRequest { client: true, .. } => self.refuse_client(&msg.from, None)?,

            Message::ConnectResponse { success, .. } => {
                self.peer_accepted(&msg.from, success);
            }

            // A peer that lost its leader in our term can't disrupt us, since
            // its next term is above ours anyway.
            Message::PreVote { term, last_index, last_term } => {
                let vote = term > self.term && self.is_up_to_date(last_index, last_term);
                self.send(&msg.from, Message::PreVoteResponse { term, vote })?;
            }

            // We already voted for ourself in this term.
            Message::Campaign { .. } => {
                self.send(&msg.from, Message::CampaignResponse { vote: false })?;
            }

            // If we received a vote, record it. If the vote gives us quorum,
            // assume leadership.
            Message::CampaignResponse { vote: true } => {
                if self.membership.is_voter(&msg.from) {
                    self.role.votes.insert(msg.from);
                }
                return self.maybe_win();
            }

            Message::CampaignResponse { vote: false } | Message::PreVoteResponse { .. } => {}

            // If we receive a message from a leader in our term, we lost the
            // election. Follow it and step the message.
            Message::Append { .. } | Message::InstallSnapshot { .. } => {
                let from = msg.from.clone();
                return self.into_follower(msg.term, Some(from))?.step(msg);
            }

            // Abort client requests while campaigning. The client must retry.
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
                let status = self.status("candidate", None, BTreeMap::new());
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

        // If the election times out, fall back to a follower in the same term
        // and poll again before starting a new election.
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            info!("Election timed out in term {}", self.term);
            let election_timeout = self.gen_election_timeout();
            let voted_for = Some(self.id.clone());
            let node = self.into_role(Follower::new(None, voted_for, election_timeout));
            if node.membership.can_reach_quorum() {
                return node.prevote();
            }
            return Ok(node.into());
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by increasing the term, voting for ourself, and
    /// soliciting votes from all voters.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id.clone());
        self.term = term;
        self.log.set_term(term, Some(self.id.clone()))?;

        let (last_index, last_term) = self.log.get_last_index();
        debug!("Campaigning with last entry {last_index}/{last_term}");
        self.broadcast(Message::Campaign { last_index, last_term, transfer: false })
    }
}
