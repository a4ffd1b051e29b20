use super::{ClientID, ClusterRecord, Command, Entry, Index, Kind, Response, SessionTable, Term};
use crate::encoding::Value as _;
use crate::error::{Error, Result};

use log::debug;
use std::io::{Read, Write};

/// A Raft-managed application state machine. Raft itself does not care what
/// the state machine is, nor what the commands and results do. It will simply
/// apply arbitrary binary commands sequentially from the Raft log, returning
/// an arbitrary binary result to the client.
///
/// Since commands are applied identically across all replicas, they must be
/// deterministic and yield the same state and result across all replicas too.
/// Otherwise, the replicas will diverge.
///
/// Raft takes care of exactly-once application: client retries are detected
/// via the session table and answered from a response cache, so apply() is
/// never called twice for the same client request.
pub trait State: Send {
    /// Applies a command to the state machine, returning a client result.
    ///
    /// Input errors are deterministic: the command is considered applied and
    /// the error is returned to the client as a failed response. Any other
    /// error halts the node, since the replica states would otherwise
    /// diverge.
    fn apply(&mut self, index: Index, command: &[u8]) -> Result<Vec<u8>>;

    /// Writes the full state to a snapshot.
    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Replaces the state with one read from a snapshot written by save().
    fn load(&mut self, reader: &mut dyn Read) -> Result<()>;
}

/// The result of applying an entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    /// The entry index.
    pub index: Index,
    /// The entry term.
    pub term: Term,
    /// The client session, or 0 for internal entries.
    pub client_id: ClientID,
    /// The internal command that was executed, if any.
    pub command: Option<Command>,
    /// The response.
    pub response: Response,
}

/// The replicated state of a node: the application state machine, plus
/// Raft's own state (the session table and cluster record) which is modified
/// by internal commands. Everything here is captured by snapshots.
pub struct Machine {
    state: Box<dyn State>,
    sessions: SessionTable,
    cluster: ClusterRecord,
    applied_index: Index,
    applied_term: Term,
}

impl Machine {
    /// Creates a machine with an empty session table.
    pub fn new(state: Box<dyn State>, cluster: ClusterRecord) -> Self {
        Self { state, sessions: SessionTable::new(), cluster, applied_index: 0, applied_term: 0 }
    }

    /// Returns the last applied index and term.
    pub fn get_applied_index(&self) -> (Index, Term) {
        (self.applied_index, self.applied_term)
    }

    /// Returns the session table.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Returns the applied cluster record.
    pub fn cluster(&self) -> &ClusterRecord {
        &self.cluster
    }

    /// Returns the application state machine.
    pub fn state(&self) -> &dyn State {
        self.state.as_ref()
    }

    /// Replaces the machine contents with restored snapshot data. The
    /// application state is read from the reader.
    pub fn restore(
        &mut self,
        (index, term): (Index, Term),
        cluster: ClusterRecord,
        sessions: SessionTable,
        reader: &mut dyn Read,
    ) -> Result<()> {
        self.state.load(reader)?;
        self.cluster = cluster;
        self.sessions = sessions;
        self.applied_index = index;
        self.applied_term = term;
        Ok(())
    }

    /// Applies a committed entry. User entries that were already applied for
    /// the client session return the cached response.
    pub fn apply(&mut self, entry: &Entry) -> Result<Applied> {
        assert_eq!(entry.index, self.applied_index + 1, "applied index gap");
        debug!("Applying {entry:?}");
        let (command, response) = match entry.kind {
            Kind::Internal => {
                let command = Command::decode(&entry.payload)?;
                let response = self.execute(&command);
                (Some(command), response)
            }
            Kind::User => (None, self.apply_user(entry)?),
        };
        self.applied_index = entry.index;
        self.applied_term = entry.term;
        Ok(Applied { index: entry.index, term: entry.term, client_id: entry.client_id, command, response })
    }

    /// Applies a user entry to the application state machine, unless it was
    /// already applied.
    fn apply_user(&mut self, entry: &Entry) -> Result<Response> {
        let sequence = entry.sequence;
        if let Some(response) = self.sessions.cached_response(entry.client_id, sequence) {
            debug!("Returning cached response for client {} sequence {sequence}", entry.client_id);
            return Ok(response.clone());
        }
        if self.sessions.get(entry.client_id).is_none() {
            return Ok(Response::failed(sequence, format!("unknown client session {}", entry.client_id)));
        }
        if self.sessions.is_acknowledged(entry.client_id, sequence) {
            return Ok(Response::failed(sequence, format!("sequence {sequence} already acknowledged")));
        }
        let response = match self.state.apply(entry.index, &entry.payload) {
            Ok(data) => Response::ok(sequence, data),
            Err(Error::InvalidInput(message)) => Response::failed(sequence, message),
            Err(err) => return Err(err),
        };
        self.sessions.record_response(entry, response.clone());
        Ok(response)
    }

    /// Executes an internal command.
    fn execute(&mut self, command: &Command) -> Response {
        match command {
            Command::Noop => Response::ok(0, Vec::new()),
            Command::Register { name } => {
                let session = self.sessions.register(name);
                Response::ok(0, session.client_id.to_le_bytes().to_vec())
            }
            Command::Unregister { client_id } => match self.sessions.unregister(*client_id) {
                Some(_) => Response::ok(0, Vec::new()),
                None => Response::failed(0, format!("unknown client session {client_id}")),
            },
            Command::Config(cluster) => {
                self.cluster = cluster.clone();
                Response::ok(0, Vec::new())
            }
            Command::Join(node) => {
                match self.cluster.get_mut(&node.name) {
                    Some(existing) => *existing = node.clone(),
                    None => self.cluster.peers.push(node.clone()),
                }
                let session = self.sessions.register(&node.name);
                Response::ok(0, session.client_id.to_le_bytes().to_vec())
            }
        }
    }
}
