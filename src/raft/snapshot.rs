use super::{ClusterRecord, Index, Machine, SessionTable, Term, Ticks};
use crate::encoding::{bincode, checksum::HashReader, checksum::HashWriter};
use crate::errdata;
use crate::error::Result;

use log::{info, warn};
use memmap2::{Mmap, MmapOptions};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read as _, Seek as _, SeekFrom, Write as _};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The snapshot header, following the leading checksum. The application
/// state written by `State::save` follows it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub term: Term,
    pub index: Index,
    pub cluster: ClusterRecord,
    pub sessions: SessionTable,
}

/// The size of the leading CRC32.
const CHECKSUM_SIZE: usize = 4;

/// Stores a node's snapshot as a single file, `<cluster>.snapshot`, in the
/// data directory. The file contains a little-endian CRC32 of the rest of the
/// file, followed by a SnapshotHeader and the application state.
///
/// Snapshots are written to a temporary file which is synced and atomically
/// renamed into place, so the snapshot file is either absent, the previous
/// snapshot, or the new one. Snapshots received from the leader are written
/// to a separate receive file, and renamed into place once complete and
/// verified.
///
/// Snapshot files are never modified once in place. A SnapshotSender can
/// thus keep memory-mapping windows of a snapshot while a new one replaces it,
/// since it holds the replaced file open.
pub struct SnapshotStore {
    dir: PathBuf,
    name: String,
    fsync: bool,
    chunk_size: usize,
    map_size: usize,
    max_inflight: usize,
}

impl SnapshotStore {
    /// Creates a snapshot store for the given cluster name.
    pub fn new(dir: &Path, name: &str, fsync: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            fsync,
            chunk_size: 64 * 1024,
            map_size: 4 * 1024 * 1024,
            max_inflight: 4,
        }
    }

    /// Sets the transfer chunk size, mapped window size, and the number of
    /// unacknowledged chunks a sender may have in flight.
    pub fn with_transfer(mut self, chunk_size: usize, map_size: usize, max_inflight: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.map_size = map_size.max(self.chunk_size);
        self.max_inflight = max_inflight.max(1);
        self
    }

    /// Returns the snapshot file path.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.snapshot", self.name))
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.snapshot.tmp", self.name))
    }

    fn recv_path(&self) -> PathBuf {
        self.dir.join(format!("{}.snapshot.recv", self.name))
    }

    /// Takes a snapshot of the machine at its applied index. Returns the
    /// snapshot index and term.
    pub fn take(&self, machine: &Machine) -> Result<(Index, Term)> {
        let (index, term) = machine.get_applied_index();
        let header = SnapshotHeader {
            term,
            index,
            cluster: machine.cluster().clone(),
            sessions: machine.sessions().clone(),
        };

        let tmp = self.tmp_path();
        let mut file = File::create(&tmp)?;
        file.write_all(&[0; CHECKSUM_SIZE])?;
        let mut writer = HashWriter::new(BufWriter::new(file));
        bincode::serialize_into(&mut writer, &header)?;
        machine.state().save(&mut writer)?;
        let (crc, writer) = writer.finish();
        let mut file = writer.into_inner().map_err(|err| err.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&crc.to_le_bytes())?;
        if self.fsync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&tmp, self.path())?;
        info!("Took snapshot at index {index} term {term}");
        Ok((index, term))
    }

    /// Loads the snapshot into the machine, if there is a valid one. Returns
    /// the snapshot index and term. A corrupt snapshot is deleted, and the node
    /// must recover the state from the log or the leader.
    pub fn load(&self, machine: &mut Machine) -> Result<Option<(Index, Term)>> {
        remove_if_exists(&self.tmp_path())?;
        remove_if_exists(&self.recv_path())?;
        let path = self.path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        // SAFETY: snapshot files are only ever replaced by rename, never
        // modified in place.
        let map = unsafe { Mmap::map(&file)? };
        let Some(data) = verify(&map) else {
            warn!("Discarding corrupt snapshot {}", path.display());
            std::fs::remove_file(&path)?;
            return Ok(None);
        };

        let mut reader = data;
        let header: SnapshotHeader = bincode::deserialize_from(&mut reader)?;
        let snapshot = (header.index, header.term);
        machine.restore(snapshot, header.cluster, header.sessions, &mut reader)?;
        info!("Loaded snapshot at index {} term {}", snapshot.0, snapshot.1);
        Ok(Some(snapshot))
    }

    /// Deletes the snapshot, if any.
    pub fn delete(&self) -> Result<()> {
        remove_if_exists(&self.path())?;
        remove_if_exists(&self.tmp_path())?;
        remove_if_exists(&self.recv_path())
    }

    /// Creates a sender for the current snapshot, or None if there is none.
    pub fn sender(&self) -> Result<Option<SnapshotSender>> {
        let file = match File::open(self.path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        let header = read_header(&file)?;
        Ok(Some(SnapshotSender {
            file,
            len,
            index: header.index,
            term: header.term,
            window: None,
            chunk_size: self.chunk_size,
            map_size: self.map_size,
            max_inflight: self.max_inflight,
            offset: 0,
            acked: 0,
            in_flight: 0,
            since_ack: 0,
        }))
    }

    /// Starts receiving a snapshot with the given index and term, discarding
    /// any partially received one.
    pub fn receiver(&self, index: Index, term: Term) -> Result<SnapshotReceiver> {
        let path = self.recv_path();
        let file = File::create(&path)?;
        info!("Receiving snapshot at index {index} term {term}");
        Ok(SnapshotReceiver { path, file, index, term, offset: 0 })
    }

    /// Installs a fully received snapshot: verifies it, moves it into place,
    /// and loads it into the machine. Returns None if the received file is
    /// corrupt or isn't the announced snapshot, in which case it is discarded
    /// and the current snapshot is kept.
    pub fn install(&self, receiver: SnapshotReceiver, machine: &mut Machine) -> Result<Option<(Index, Term)>> {
        let SnapshotReceiver { path, file, index, term, offset } = receiver;
        if self.fsync {
            file.sync_all()?;
        }
        drop(file);
        if !verify_file(&path)? {
            warn!("Discarding corrupt received snapshot at index {index} ({offset} bytes)");
            std::fs::remove_file(&path)?;
            return Ok(None);
        }
        let header = match read_header(&File::open(&path)?) {
            Ok(header) => header,
            Err(err) => {
                warn!("Discarding undecodable received snapshot at index {index}: {err}");
                std::fs::remove_file(&path)?;
                return Ok(None);
            }
        };
        if (header.index, header.term) != (index, term) {
            warn!(
                "Discarding received snapshot at {}/{}, expected {index}/{term}",
                header.index, header.term
            );
            std::fs::remove_file(&path)?;
            return Ok(None);
        }
        std::fs::rename(&path, self.path())?;
        match self.load(machine)? {
            Some(snapshot) => Ok(Some(snapshot)),
            None => errdata!("installed snapshot vanished"),
        }
    }
}

/// Reads the header of a snapshot file, without verifying its checksum.
fn read_header(file: &File) -> Result<SnapshotHeader> {
    let mut reader = std::io::BufReader::new(file);
    reader.seek(SeekFrom::Start(CHECKSUM_SIZE as u64))?;
    bincode::deserialize_from(&mut reader)
}

/// Verifies a mapped snapshot's leading checksum, returning the data after it.
fn verify(map: &[u8]) -> Option<&[u8]> {
    if map.len() < CHECKSUM_SIZE {
        return None;
    }
    let (crc, data) = map.split_at(CHECKSUM_SIZE);
    let crc = u32::from_le_bytes(crc.try_into().ok()?);
    (crc32fast::hash(data) == crc).then_some(data)
}

/// Verifies a snapshot file's checksum by streaming it.
fn verify_file(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let mut crc = [0; CHECKSUM_SIZE];
    if file.read_exact(&mut crc).is_err() {
        return Ok(false);
    }
    let mut reader = HashReader::new(std::io::BufReader::new(file));
    std::io::copy(&mut reader, &mut std::io::sink())?;
    Ok(reader.checksum() == u32::from_le_bytes(crc))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// A snapshot chunk. Outbound chunks borrow from a shared read-only mapping
/// of the snapshot file, which stays mapped until every chunk referencing it
/// is dropped. Chunks decoded from the wire own their bytes.
#[derive(Clone)]
pub enum Chunk {
    Mapped { map: Arc<Mmap>, range: Range<usize> },
    Owned(Vec<u8>),
}

impl Chunk {
    /// Returns the chunk bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Mapped { map, range } => &map[range.clone()],
            Chunk::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Owned(bytes)
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chunk({} bytes)", self.len())
    }
}

impl Serialize for Chunk {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> Deserialize<'de> for Chunk {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_bytes::ByteBuf::deserialize(deserializer).map(|bytes| Chunk::Owned(bytes.into_vec()))
    }
}

/// Streams a snapshot file to a follower in chunks. The file is mapped in
/// windows of map_size bytes, remapped as the cursor moves past the current
/// window. At most max_inflight chunks are unacknowledged at a time.
///
/// The transfer is done only when every chunk, including the final one, has
/// been acknowledged. A rejected chunk rewinds the cursor to the offset the
/// follower expects, and a stalled transfer rewinds to the last acknowledged
/// offset.
pub struct SnapshotSender {
    file: File,
    len: u64,
    index: Index,
    term: Term,
    /// The current window's file offset and mapping.
    window: Option<(u64, Arc<Mmap>)>,
    chunk_size: usize,
    map_size: usize,
    max_inflight: usize,
    /// The offset of the next chunk to send.
    offset: u64,
    /// The offset up to which the follower has acknowledged chunks.
    acked: u64,
    in_flight: usize,
    since_ack: Ticks,
}

impl std::fmt::Debug for SnapshotSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSender")
            .field("index", &self.index)
            .field("term", &self.term)
            .field("len", &self.len)
            .field("offset", &self.offset)
            .field("acked", &self.acked)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl SnapshotSender {
    /// Returns the snapshot index and term.
    pub fn snapshot(&self) -> (Index, Term) {
        (self.index, self.term)
    }

    /// Returns the next chunk to send as (offset, chunk, done), or None if
    /// the whole file has been sent or too many chunks are in flight.
    pub fn next_chunk(&mut self) -> Result<Option<(u64, Chunk, bool)>> {
        if self.offset >= self.len || self.in_flight >= self.max_inflight {
            return Ok(None);
        }
        let (start, map) = match &self.window {
            Some((start, map)) if self.offset >= *start && self.offset < start + map.len() as u64 => {
                (*start, map.clone())
            }
            _ => {
                let start = self.offset;
                let len = (self.len - start).min(self.map_size as u64) as usize;
                // SAFETY: snapshot files are never modified in place, and we
                // hold the file open even if a new snapshot replaces it.
                let map = Arc::new(unsafe { MmapOptions::new().offset(start).len(len).map(&self.file)? });
                self.window = Some((start, map.clone()));
                (start, map)
            }
        };
        let from = (self.offset - start) as usize;
        let to = (from + self.chunk_size).min(map.len());
        let offset = self.offset;
        self.offset += (to - from) as u64;
        self.in_flight += 1;
        Ok(Some((offset, Chunk::Mapped { map, range: from..to }, self.offset == self.len)))
    }

    /// Records that the follower has received all bytes before the offset.
    pub fn ack(&mut self, offset: u64) {
        if offset <= self.acked {
            return;
        }
        self.acked = offset.min(self.len);
        self.in_flight = self.in_flight.saturating_sub(1);
        self.since_ack = 0;
    }

    /// Rewinds the cursor to the given offset, e.g. because the follower
    /// rejected a chunk and expects this offset. Chunks in flight are
    /// considered lost.
    pub fn rewind(&mut self, offset: u64) {
        if offset > self.offset {
            return;
        }
        self.offset = offset;
        self.acked = self.acked.min(offset);
        self.in_flight = 0;
        self.since_ack = 0;
    }

    /// Advances the stall timer by a tick. If no chunk was acknowledged within
    /// the timeout, rewinds to the last acknowledged offset. Returns true if it
    /// rewound.
    pub fn tick(&mut self, timeout: Ticks) -> bool {
        if self.in_flight == 0 && self.offset >= self.len {
            return false;
        }
        self.since_ack = self.since_ack.saturating_add(1);
        if self.since_ack < timeout {
            return false;
        }
        warn!("Snapshot transfer stalled at offset {}, retrying", self.acked);
        self.rewind(self.acked);
        true
    }

    /// Returns true once every byte has been acknowledged.
    pub fn is_done(&self) -> bool {
        self.acked == self.len && self.in_flight == 0
    }
}

/// Receives a snapshot from the leader, writing chunks in order to the
/// receive file.
#[derive(Debug)]
pub struct SnapshotReceiver {
    path: PathBuf,
    file: File,
    index: Index,
    term: Term,
    offset: u64,
}

impl SnapshotReceiver {
    /// Returns the snapshot index and term.
    pub fn snapshot(&self) -> (Index, Term) {
        (self.index, self.term)
    }

    /// Returns the next expected offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Writes a chunk at the given offset. Returns false if the chunk is out
    /// of order, in which case the sender should rewind to offset().
    pub fn write(&mut self, offset: u64, chunk: &[u8]) -> Result<bool> {
        if offset != self.offset {
            return Ok(false);
        }
        self.file.write_all(chunk)?;
        self.offset += chunk.len() as u64;
        Ok(true)
    }

    /// Discards the received data.
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        remove_if_exists(&self.path)
    }
}
