//! Bincode is used to encode log entries, snapshots, metadata records and
//! network messages. It is a Rust-specific encoding that depends on the
//! internal data structures being stable, which is fine as long as all nodes
//! run the same build. See: https://github.com/bincode-org/bincode
//!
//! This module wraps the standard bincode crate to change the default options,
//! in particular to use variable-length rather than fixed-length integers.
//! Upstream bincode::(de)serialize uses fixed-length options while
//! DefaultOptions uses variable-length ones, so this module always goes through
//! DefaultOptions to keep the on-disk and on-wire formats identical.

use crate::error::{Error, Result};

use bincode::Options;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode. Trailing bytes are an error, since
/// they indicate a framing problem.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Deserializes a value from a reader using Bincode.
pub fn deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<T> {
    Ok(bincode().deserialize_from(reader)?)
}

/// Deserializes a value from a reader using Bincode, or returns None if the
/// reader is closed (e.g. a peer disconnected between messages).
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match bincode().deserialize_from(reader) {
        Ok(v) => Ok(Some(v)),
        Err(e) => match *e {
            bincode::ErrorKind::Io(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(None),
                std::io::ErrorKind::ConnectionReset => Ok(None),
                _ => Err(Error::from(e)),
            },
            e => Err(Error::InvalidData(e.to_string())),
        },
    }
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}

/// Serializes a value to a writer using Bincode.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize + ?Sized>(
    writer: W,
    value: &T,
) -> Result<()> {
    Ok(bincode().serialize_into(writer, value)?)
}

/// Returns the serialized size of a value, without serializing it.
pub fn serialized_size<T: serde::Serialize + ?Sized>(value: &T) -> Result<u64> {
    Ok(bincode().serialized_size(value)?)
}
