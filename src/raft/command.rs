use super::{ClientID, ClusterRecord, NodeID, NodeRecord};
use crate::encoding;

use serde::{Deserialize, Serialize};

/// An internal command, stored as the payload of Kind::Internal log entries and
/// executed by Raft itself rather than the application state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Appended by a new leader to commit entries from previous terms (see
    /// section 5.4.2 in the Raft paper). Applying it marks the start of the
    /// leader's term.
    Noop,
    /// Registers a client session.
    Register { name: NodeID },
    /// Removes a client session.
    Unregister { client_id: ClientID },
    /// Replaces the cluster record.
    Config(ClusterRecord),
    /// Adds a node to the cluster record, or replaces its record, and
    /// registers a session for it.
    Join(NodeRecord),
}

impl encoding::Value for Command {}
