//! Implements the Raft distributed consensus protocol, with pre-vote,
//! snapshots, and client sessions.
//!
//! For details, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//! * Raft website: <https://raft.github.io>
//!
//! Raft is a protocol for a group of computers to agree on some data -- or more
//! simply, to replicate the data. It does this by electing a single leader node
//! which serves client requests and replicates writes to other nodes. Requests
//! are executed once they have been confirmed by a strict majority of voters (a
//! quorum). If a leader fails, a new leader is elected.
//!
//! RAFT LOG AND STATE MACHINE
//! ==========================
//!
//! Raft maintains an ordered command log containing arbitrary commands
//! submitted by clients, and replicates it to a majority of nodes. Once
//! committed, the commands are applied sequentially to a local state machine on
//! each node. Raft doesn't care what the state machine is: it passes opaque
//! commands to an opaque `State` implementation. Raft's own bookkeeping (client
//! sessions and the cluster record) is replicated through the same log as
//! internal `Command`s, and lives alongside the application state in a
//! `Machine`.
//!
//! The log is stored in fixed-size, memory-mapped segment files (see `Log`).
//! Each append is checksummed, so a write torn by a crash is detected on
//! startup and the affected segment discarded. The missing entries are then
//! recovered from the leader.
//!
//! LEADER ELECTION
//! ===============
//!
//! Nodes are followers, candidates, or leaders, modeled as `Node::Follower`,
//! `Node::Candidate`, and `Node::Leader`. Raft divides time into terms, and
//! there can be at most one leader per term. Nodes store their term and vote
//! durably before acting on them (see `Log::set_term()`), and messages from
//! past terms are rejected.
//!
//! A follower that hasn't heard from a leader within its randomized election
//! timeout first runs a pre-vote (Raft thesis section 9.6): it asks the voters
//! whether they would vote for it in the next term, without changing its own
//! term. Voters only agree if they have lost their leader too and the poller's
//! log is at least as up-to-date as theirs. Only with a quorum of pre-votes
//! does the follower become a candidate, bump its term, and send
//! `Message::Campaign` to all voters. This way, a node that was partitioned
//! away can't disrupt a healthy cluster by campaigning in ever higher terms.
//! Nodes also don't poll at all unless they're connected to a quorum.
//!
//! A voter grants a single vote per term, on a first-come basis, to
//! candidates with an up-to-date log. A candidate with a quorum of votes
//! becomes leader, and appends a noop entry to commit entries from previous
//! terms (Raft paper section 5.4.2). Once the noop is applied the leader's term
//! has started, and it begins accepting clients.
//!
//! REPLICATION
//! ===========
//!
//! The leader appends client commands to its log and sends them in
//! `Message::Append`, as the raw framed records from its segment files. The
//! records are borrowed from the segment mappings and copied once into the
//! message, without decoding and re-encoding entries. The message can't
//! borrow the mapping itself, since it outlives the call on the connection
//! threads while the tail segment may be truncated by a later splice. Each
//! append carries the index and term of the preceding entry, which followers
//! check against their log before splicing in the entries (Raft paper section
//! 5.3). Followers that reject an append report their last index, and the
//! leader backs off to probe an earlier base.
//!
//! Each follower has at most one append in flight. Entries proposed while one
//! is pending are sent as a batch when the follower responds, or on the next
//! heartbeat, up to `Options::max_append_bytes`. An entry is committed once a
//! quorum of voters has it, and it is from the leader's term.
//!
//! SNAPSHOTS AND COMPACTION
//! ========================
//!
//! Once all entries in a log segment have been applied, the node takes a
//! snapshot of its `Machine` and deletes the segment (see `SnapshotStore`). A
//! follower that needs compacted entries is sent the snapshot instead, in
//! chunks mapped from the snapshot file, with a bounded number of chunks in
//! flight. The follower verifies the snapshot's checksum, installs it, and
//! resumes log replication after it.
//!
//! CLIENT SESSIONS
//! ===============
//!
//! Clients connect to the leader and register a session, which is replicated
//! through the log. Each request carries an increasing sequence number, and the
//! session table caches responses until the client acknowledges them. If a
//! leader change aborts a request (`Error::Abort`), the client retries it with
//! the same sequence number at the new leader, and the retry returns the cached
//! response instead of applying the command twice.
//!
//! CLUSTER MEMBERSHIP
//! ==================
//!
//! The cluster record lists all members, their roles, and addresses. The
//! leader replicates its view of the record (itself as leader, and peer
//! connectivity) as an internal command, so all nodes converge on it, and
//! publishes applied records to its clients. Only leaders and peers vote.
//! Membership changes beyond this, e.g. joint consensus, are not supported: the
//! cluster must be restarted with a new record.

mod client;
mod cluster;
mod command;
mod log;
mod message;
mod meta;
mod node;
mod server;
mod session;
mod snapshot;
mod state;

pub use client::Client;
pub use cluster::{ClusterRecord, Membership, Mode, NodeRecord, NodeRole, Progress, TransportRecord};
pub use command::Command;
pub use log::{decode_records, Entry, Index, Kind, Log, Status as LogStatus};
pub use message::{Envelope, Message, Status};
pub use meta::Metadata;
pub use node::{Node, NodeID, Options, Term, Ticks};
pub use server::Server;
pub use session::{ClientID, Response, Sequence, Session, SessionTable};
pub use snapshot::{Chunk, SnapshotHeader, SnapshotReceiver, SnapshotSender, SnapshotStore};
pub use state::{Applied, Machine, State};

/// The interval between Raft ticks, the unit of time.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// The interval between leader heartbeats in ticks.
const HEARTBEAT_INTERVAL: Ticks = 4;

/// The default election timeout range in ticks. This is randomized in this
/// interval, to avoid election ties.
const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The maximum size of the entries in a single append message.
const MAX_APPEND_BYTES: usize = 1024 * 1024;

/// The default size of log segment files.
const SEGMENT_SIZE: usize = 64 * 1024 * 1024;
