use super::{Entry, NodeID};
use crate::encoding;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client session ID. 0 is reserved for internal entries.
pub type ClientID = u32;

/// A client request sequence number. Starts at 1, 0 means none.
pub type Sequence = u64;

/// The result of applying a command, cached per client session to make
/// retries idempotent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The request sequence number.
    pub sequence: Sequence,
    /// Whether the command succeeded.
    pub success: bool,
    /// The command result, or an error message on failure.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl encoding::Value for Response {}

impl Response {
    /// Creates a successful response.
    pub fn ok(sequence: Sequence, data: Vec<u8>) -> Self {
        Self { sequence, success: true, data }
    }

    /// Creates a failed response with an error message.
    pub fn failed(sequence: Sequence, message: impl std::fmt::Display) -> Self {
        Self { sequence, success: false, data: message.to_string().into_bytes() }
    }

    /// Converts the response into a client result. Failures are input errors
    /// carrying the failure message.
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self.success {
            true => Ok(self.data),
            false => Err(Error::InvalidInput(String::from_utf8_lossy(&self.data).into_owned())),
        }
    }
}

/// A client session. Tracks the client's last request, and caches responses
/// that the client hasn't acknowledged yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub client_id: ClientID,
    pub name: NodeID,
    /// The sequence number of the last applied request.
    pub last_sequence: Sequence,
    /// The highest sequence number acknowledged by the client.
    pub last_acknowledge: Sequence,
    /// Cached responses above last_acknowledge, by sequence number.
    responses: BTreeMap<Sequence, Response>,
}

impl Session {
    /// Returns the number of cached responses.
    pub fn cached(&self) -> usize {
        self.responses.len()
    }
}

/// The session table. It is part of the replicated state: sessions are
/// created and removed by internal Register and Unregister commands, and
/// responses are recorded as entries are applied, so all replicas agree on
/// which commands have been applied. It is included in snapshots.
///
/// When a client retries a request (e.g. after a leader change), the retry is
/// appended to the log again. When applied, the cached response is returned
/// instead of applying the command a second time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: BTreeMap<ClientID, Session>,
}

impl encoding::Value for SessionTable {}

impl SessionTable {
    /// Creates an empty session table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client session by name, returning the existing session if
    /// the client is already registered. New sessions get the lowest free
    /// client ID above 0.
    pub fn register(&mut self, name: &str) -> &Session {
        let client_id = match self.find(name) {
            Some(session) => session.client_id,
            None => {
                let client_id = (1..).find(|id| !self.sessions.contains_key(id)).unwrap_or(ClientID::MAX);
                self.sessions.insert(
                    client_id,
                    Session {
                        client_id,
                        name: name.to_string(),
                        last_sequence: 0,
                        last_acknowledge: 0,
                        responses: BTreeMap::new(),
                    },
                );
                client_id
            }
        };
        &self.sessions[&client_id]
    }

    /// Removes a client session.
    pub fn unregister(&mut self, client_id: ClientID) -> Option<Session> {
        self.sessions.remove(&client_id)
    }

    /// Fetches a session by client ID.
    pub fn get(&self, client_id: ClientID) -> Option<&Session> {
        self.sessions.get(&client_id)
    }

    /// Looks up a session by client name.
    pub fn find(&self, name: &str) -> Option<&Session> {
        self.sessions.values().find(|s| s.name == name)
    }

    /// Returns all sessions, by client ID.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Returns the cached response for a client request, if any.
    pub fn cached_response(&self, client_id: ClientID, sequence: Sequence) -> Option<&Response> {
        self.sessions.get(&client_id)?.responses.get(&sequence)
    }

    /// Returns true if the client has acknowledged the sequence number. Such
    /// requests have been applied and their responses discarded, so they must
    /// not be applied again.
    pub fn is_acknowledged(&self, client_id: ClientID, sequence: Sequence) -> bool {
        self.sessions.get(&client_id).is_some_and(|s| sequence <= s.last_acknowledge)
    }

    /// Records the response to an applied entry, and discards cached responses
    /// that the entry acknowledges.
    pub fn record_response(&mut self, entry: &Entry, response: Response) {
        let Some(session) = self.sessions.get_mut(&entry.client_id) else { return };
        session.responses.insert(entry.sequence, response);
        if entry.acknowledge > session.last_acknowledge {
            session.last_acknowledge = entry.acknowledge;
            session.responses = session.responses.split_off(&(entry.acknowledge + 1));
        }
        session.last_sequence = session.last_sequence.max(entry.sequence);
    }
}
