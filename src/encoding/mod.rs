//! Binary data encodings.
//!
//! * bincode: used for log entries, snapshots, metadata and network messages.
//! * checksum: CRC32 framing for files that must detect torn or corrupt writes.

pub mod bincode;
pub mod checksum;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Adds automatic Bincode encode/decode methods to value types. These are used
/// for log entries and on-disk records, as well as network protocol messages.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Decodes a value from a reader using Bincode.
    fn decode_from<R: Read>(reader: R) -> Result<Self> {
        bincode::deserialize_from(reader)
    }

    /// Decodes a value from a reader using Bincode, or returns None if the
    /// reader is closed.
    fn maybe_decode_from<R: Read>(reader: R) -> Result<Option<Self>> {
        bincode::maybe_deserialize_from(reader)
    }

    /// Encodes a value to a byte vector using Bincode.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Encodes a value into a writer using Bincode.
    fn encode_into<W: Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)
    }

    /// Returns the encoded size of the value in bytes.
    fn encoded_size(&self) -> Result<u64> {
        bincode::serialized_size(self)
    }
}

/// Blanket implementations for various types wrapping a value type.
impl<V: Value> Value for Option<V> {}
impl<V: Value> Value for Vec<V> {}
impl<V1: Value, V2: Value> Value for (V1, V2) {}
impl<V: Value + Ord> Value for BTreeSet<V> {}
impl<K: Value + Ord, V: Value> Value for BTreeMap<K, V> {}
