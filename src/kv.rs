//! A basic key/value state machine, served by the toyraft binary.

use crate::encoding::{self, bincode, Value as _};
use crate::errinput;
use crate::error::Result;
use crate::raft;

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// A key/value command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Fetches a value.
    Get(String),
    /// Sets a key to a value, returning the previous value.
    Set {
        key: String,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    /// Deletes a key, returning the previous value.
    Delete(String),
}

impl encoding::Value for Command {}

/// The result of a key/value command: the current value for Get, and the
/// previous value for Set and Delete.
pub type Value = Option<Vec<u8>>;

/// A key/value state machine. Keys must be non-empty.
#[derive(Debug, Default)]
pub struct KV {
    data: BTreeMap<String, Vec<u8>>,
}

impl KV {
    /// Creates a new, empty key/value state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a command result.
    pub fn decode_value(bytes: &[u8]) -> Result<Value> {
        bincode::deserialize(bytes)
    }
}

impl raft::State for KV {
    fn apply(&mut self, index: raft::Index, command: &[u8]) -> Result<Vec<u8>> {
        let command = match Command::decode(command) {
            Ok(command) => command,
            Err(err) => return errinput!("invalid command: {err}"),
        };
        debug!("Applying {command:?} at index {index}");
        let value = match command {
            Command::Get(key) => self.data.get(&key).cloned(),
            Command::Set { key, .. } if key.is_empty() => return errinput!("empty key"),
            Command::Set { key, value } => self.data.insert(key, value),
            Command::Delete(key) => self.data.remove(&key),
        };
        bincode::serialize(&value)
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(writer, &self.data)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.data = bincode::deserialize_from(reader)?;
        Ok(())
    }
}
