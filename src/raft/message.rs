use super::{Chunk, ClusterRecord, Index, LogStatus, NodeID, NodeRecord, Sequence, Term};
use crate::encoding;
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A message envelope specifying the sender and receiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The recipient.
    pub to: NodeID,
    /// The message.
    pub message: Message,
}

impl encoding::Value for Envelope {}

/// A message sent between Raft nodes, and between clients and nodes. Only
/// Raft protocol messages (see `is_raft`) are subject to term checks, the
/// envelope term of connection and client messages is informational.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sent on a new connection. Peers announce themselves, clients ask to
    /// register a session, which only a leader in a started term accepts.
    ConnectRequest {
        /// The cluster name. Must match the receiver's cluster.
        cluster: String,
        /// True if the sender is a client rather than a peer.
        client: bool,
    },
    /// The response to a ConnectRequest.
    ConnectResponse {
        /// Whether the connection was accepted.
        success: bool,
        /// The current leader, if known. Clients redirect to it.
        leader: Option<NodeID>,
        /// The receiver's cluster record.
        cluster: ClusterRecord,
        /// For clients, the session's last applied sequence number. The client
        /// continues numbering requests from it.
        sequence: Sequence,
        /// For clients, the session's last acknowledged sequence number.
        acknowledge: Sequence,
    },

    /// A follower polls peers before campaigning, without changing its term.
    /// Peers that have a leader or a more up-to-date log refuse, so a node
    /// that was partitioned away can't disrupt the cluster.
    PreVote {
        /// The term the sender would campaign in.
        term: Term,
        /// The index of the sender's last log entry.
        last_index: Index,
        /// The term of the sender's last log entry.
        last_term: Term,
    },
    /// A pre-vote response.
    PreVoteResponse {
        /// The pre-vote term this responds to.
        term: Term,
        /// True if the pre-vote was granted.
        vote: bool,
    },

    /// Candidates solicit votes from all voters when campaigning.
    Campaign {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
        /// A leadership transfer, which is granted even if the voter already
        /// has a leader.
        transfer: bool,
    },
    /// Voters grant a single vote per term, on a first-come basis.
    CampaignResponse {
        /// True if the vote was granted.
        vote: bool,
    },

    /// Leaders replicate log entries to followers. Also sent empty as a
    /// heartbeat.
    Append {
        /// The index of the entry immediately preceding the entries.
        base_index: Index,
        /// The term of the entry immediately preceding the entries.
        base_term: Term,
        /// The leader's commit index.
        commit_index: Index,
        /// Contiguous framed entry records, as stored in the leader's log
        /// segments. Decode with `log::decode_records`.
        #[serde(with = "serde_bytes")]
        entries: Vec<u8>,
    },
    /// A follower's response to an Append.
    AppendResponse {
        /// True if the entries were appended.
        success: bool,
        /// On success, the last index known to match the leader's log. On
        /// rejection, the rejected base index.
        index: Index,
        /// The follower's last log index.
        last_index: Index,
    },

    /// Leaders send their snapshot in chunks to followers that need entries
    /// which have been compacted away.
    InstallSnapshot {
        /// The snapshot index.
        index: Index,
        /// The snapshot term.
        term: Term,
        /// The chunk's byte offset in the snapshot file.
        offset: u64,
        /// The chunk.
        data: Chunk,
        /// True if this is the last chunk.
        done: bool,
    },
    /// A follower's response to an InstallSnapshot chunk.
    InstallSnapshotResponse {
        /// The snapshot index.
        index: Index,
        /// The next offset the follower expects.
        offset: u64,
        /// False if the chunk was rejected, in which case the leader rewinds
        /// to offset.
        success: bool,
    },

    /// A client request, submitted to the leader.
    ClientRequest {
        /// The request sequence number, increasing per client. Retries reuse
        /// the sequence number, and are applied only once.
        sequence: Sequence,
        /// The highest sequence number the client has received a response for.
        acknowledge: Sequence,
        /// The state machine command.
        #[serde(with = "serde_bytes")]
        command: Vec<u8>,
    },
    /// A client response. Error::Abort means the request may or may not have
    /// been applied, and should be retried with the same sequence number.
    ClientResponse {
        /// The request sequence number.
        sequence: Sequence,
        /// The state machine result.
        response: Result<Vec<u8>>,
    },

    /// A client ends its session. The leader answers once the session is
    /// removed.
    UnregisterRequest,
    /// The response to an UnregisterRequest.
    UnregisterResponse {
        /// Error::Abort means the request should be retried.
        response: Result<()>,
    },

    /// Asks the leader to add a node to the cluster, or to update a member's
    /// group and transports. Only one membership change is applied at a time.
    JoinRequest {
        /// The node's record. Its role can't be leader or client.
        node: NodeRecord,
    },
    /// The response to a JoinRequest.
    JoinResponse {
        /// The applied cluster record, including the node. Error::Abort means
        /// the request should be retried.
        response: Result<ClusterRecord>,
    },

    /// The leader publishes the applied cluster record to its clients.
    Publish {
        /// The cluster record.
        cluster: ClusterRecord,
    },

    /// Requests the node's status.
    StatusRequest,
    /// A status response.
    StatusResponse {
        /// The status.
        status: Status,
    },
}

impl encoding::Value for Message {}

impl Message {
    /// Returns true for Raft protocol messages between peers. These carry the
    /// sender's term, which is checked against the local term.
    pub fn is_raft(&self) -> bool {
        matches!(
            self,
            Message::PreVote { .. }
                | Message::PreVoteResponse { .. }
                | Message::Campaign { .. }
                | Message::CampaignResponse { .. }
                | Message::Append { .. }
                | Message::AppendResponse { .. }
                | Message::InstallSnapshot { .. }
                | Message::InstallSnapshotResponse { .. }
        )
    }
}

/// A node's status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node that generated this status.
    pub node: NodeID,
    /// The node's role.
    pub role: String,
    /// The current leader, if known.
    pub leader: Option<NodeID>,
    /// The current term.
    pub term: Term,
    /// The match index of each peer, as seen by the leader. Empty on
    /// followers and candidates.
    pub match_index: BTreeMap<NodeID, Index>,
    /// The applied index.
    pub applied_index: Index,
    /// The number of client sessions.
    pub sessions: usize,
    /// The applied cluster record.
    pub cluster: ClusterRecord,
    /// The log status.
    pub log: LogStatus,
}
