mod segment;

pub use segment::decode_records;
use segment::Segment;

use super::{ClientID, ClusterRecord, Metadata, NodeID, Sequence, Term};
use crate::encoding::Value;
use crate::error::Result;
use crate::{errdata, errinput};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
#[cfg(test)]
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// The kind of state machine an entry is applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// Internal commands (noops, session registration, configuration),
    /// executed by Raft itself. See `Command`.
    Internal,
    /// Application commands, passed to the `State` implementation.
    User,
}

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index. Assigned when appended to the leader's log.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The state machine the entry is applied to.
    pub kind: Kind,
    /// The submitting client's session, or 0 for internal entries.
    pub client_id: ClientID,
    /// The client's request sequence number.
    pub sequence: Sequence,
    /// The highest sequence for which the client has received a response.
    /// Cached responses up to it can be discarded.
    pub acknowledge: Sequence,
    /// The command.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Value for Entry {}

impl Entry {
    /// Creates an internal entry. The index is assigned on append.
    pub fn internal(term: Term, payload: Vec<u8>) -> Self {
        Self { index: 0, term, kind: Kind::Internal, client_id: 0, sequence: 0, acknowledge: 0, payload }
    }

    /// Creates a user entry.
    pub fn user(
        index: Index,
        term: Term,
        client_id: ClientID,
        sequence: Sequence,
        acknowledge: Sequence,
        payload: Vec<u8>,
    ) -> Self {
        Self { index, term, kind: Kind::User, client_id, sequence, acknowledge, payload }
    }
}

/// Log storage status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The number of segment files.
    pub segments: usize,
    /// The index covered by the latest snapshot.
    pub snapshot_index: Index,
    /// The last log index.
    pub last_index: Index,
    /// The commit index.
    pub commit_index: Index,
    /// Bytes left in the tail segment.
    pub remaining: usize,
}

/// The Raft log stores a sequence of commands that are replicated across
/// nodes and applied sequentially to the local state machine. Each entry
/// contains an index, the term in which the leader proposed it, the client
/// session that submitted it, and the command. For example:
///
/// Index | Term | Kind     | Client | Seq | Command
/// ------|------|----------|--------|-----|-------------------
///   1   |   1  | Internal |   0    |  0  | Noop
///   2   |   1  | Internal |   0    |  0  | Register("client")
///   3   |   1  | User     |   1    |  1  | put foo=bar
///   4   |   2  | Internal |   0    |  0  | Noop
///   5   |   2  | User     |   1    |  2  | delete foo
///
/// The log is stored as a sequence of fixed-size, memory-mapped segment files
/// (see `Segment`). Appends go to the tail segment, and a new segment is rolled
/// when an entry doesn't fit. Segment files are named by a creation sequence
/// number and record the index preceding their first entry, so the log can be
/// reassembled on startup. A segment whose checksum doesn't verify is
/// discarded along with all later segments, and the missing entries are
/// recovered from the leader.
///
/// Once a snapshot covers all entries in a segment, the segment is deleted.
/// The snapshot index and term are retained as the log's base, so that
/// appends following the snapshot can be checked against it.
///
/// The log also owns the node's durable metadata (see `Metadata`), i.e. the
/// current term and vote, which must be persisted before acting on them.
///
/// The Raft log has the following invariants:
///
/// * Entry indexes are contiguous starting after the snapshot index.
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries are durable once flushed.
/// * Committed entries are never changed or removed.
/// * Entries with the same index/term contain the same command.
/// * If two logs contain a matching index/term, all previous entries
///   are identical (see section 5.3 in the Raft paper).
pub struct Log {
    /// The data directory.
    dir: PathBuf,
    /// Segments in index order. Never empty.
    segments: VecDeque<Segment>,
    /// The size of new segment files.
    segment_size: usize,
    /// Whether to fsync writes.
    fsync: bool,
    /// The creation sequence number of the next segment file.
    next_seq: u64,
    /// The durable node metadata, including the term and vote.
    meta: Metadata,
    /// The index and term of the latest snapshot.
    snapshot_index: Index,
    snapshot_term: Term,
    /// The index and term of the last stored entry.
    last_index: Index,
    last_term: Term,
    /// The index and term of the last committed entry.
    commit_index: Index,
    commit_term: Term,
}

impl Log {
    /// Opens the log in the given directory, starting after the given
    /// snapshot. Segments that are corrupt, out of sequence, or don't connect
    /// to the snapshot are discarded.
    pub fn open(
        dir: &Path,
        meta: Metadata,
        snapshot: (Index, Term),
        segment_size: usize,
        fsync: bool,
    ) -> Result<Self> {
        let (snapshot_index, snapshot_term) = snapshot;

        // Open all segment files in creation order, discarding corrupt ones.
        let mut files = Self::segment_files(dir)?;
        files.sort();
        let next_seq = files.last().map_or(1, |(seq, _)| seq + 1);
        let mut segments = Vec::new();
        for (_, path) in files {
            match Segment::open(&path) {
                Ok(segment) => segments.push(segment),
                Err(err) => {
                    warn!("Discarding corrupt log segment: {err}");
                    std::fs::remove_file(&path)?;
                }
            }
        }

        // Chain the segments by index. A gap discards all later segments, as
        // does a chain that doesn't reach the snapshot.
        segments.sort_by_key(|s| s.prev_index());
        let mut chain: VecDeque<Segment> = VecDeque::new();
        let mut discard = Vec::new();
        for segment in segments {
            let connects = discard.is_empty()
                && match chain.back() {
                    Some(prev) => segment.prev_index() == prev.last_index(),
                    None => segment.prev_index() <= snapshot_index,
                };
            if connects {
                chain.push_back(segment);
            } else {
                discard.push(segment);
            }
        }
        if chain.back().is_some_and(|s| s.last_index() < snapshot_index) {
            discard.extend(chain.drain(..));
        }
        for segment in discard {
            warn!("Discarding disconnected log segment {}", segment.path().display());
            segment.delete()?;
        }

        // Drop segments fully covered by the snapshot, but keep the tail.
        while chain.len() > 1 && chain[0].last_index() <= snapshot_index {
            chain.pop_front().into_iter().try_for_each(Segment::delete)?;
        }

        let mut log = Self {
            dir: dir.to_path_buf(),
            segments: chain,
            segment_size,
            fsync,
            next_seq,
            meta,
            snapshot_index,
            snapshot_term,
            last_index: snapshot_index,
            last_term: snapshot_term,
            commit_index: snapshot_index,
            commit_term: snapshot_term,
        };
        if log.segments.is_empty() {
            let segment = log.create_segment(snapshot_index)?;
            log.segments.push_back(segment);
        }
        log.last_index = log.segments.back().map_or(snapshot_index, |s| s.last_index());
        log.last_term = log.term_at(log.last_index).unwrap_or(snapshot_term);
        info!(
            "Opened log with {} segments, snapshot at {}, last index {}",
            log.segments.len(),
            log.snapshot_index,
            log.last_index
        );
        Ok(log)
    }

    /// Removes all log segments in the given directory.
    pub fn purge(dir: &Path) -> Result<()> {
        for (_, path) in Self::segment_files(dir)? {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Lists segment files as (sequence number, path).
    fn segment_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let path = dirent?.path();
            if path.extension().is_some_and(|ext| ext == "log") {
                let Some(seq) = path.file_stem().and_then(|s| s.to_str()?.parse().ok()) else {
                    warn!("Ignoring unknown log file {}", path.display());
                    continue;
                };
                files.push((seq, path));
            }
        }
        Ok(files)
    }

    /// Creates a new segment file following the given index.
    fn create_segment(&mut self, prev_index: Index) -> Result<Segment> {
        let path = self.dir.join(format!("{:020}.log", self.next_seq));
        self.next_seq += 1;
        Segment::create(&path, prev_index, self.segment_size)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.meta.term, self.meta.vote.clone())
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term. The
    /// metadata file is written and synced before returning.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.meta.term, "term regression {} → {}", self.meta.term, term);
        assert!(term > self.meta.term || self.meta.vote.is_none() || vote == self.meta.vote, "can't change vote");
        if term == self.meta.term && vote == self.meta.vote {
            return Ok(());
        }
        self.meta.term = term;
        self.meta.vote = vote;
        self.meta.save(&self.dir, self.fsync)
    }

    /// Persists a new cluster record.
    pub fn set_cluster(&mut self, cluster: ClusterRecord) -> Result<()> {
        if cluster == self.meta.cluster {
            return Ok(());
        }
        self.meta.cluster = cluster;
        self.meta.save(&self.dir, self.fsync)
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the snapshot index and term, i.e. the log's base.
    pub fn get_snapshot_index(&self) -> (Index, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    /// Returns the first index that can be fetched from the log.
    #[cfg(test)]
    pub fn first_index(&self) -> Index {
        self.segments.front().map_or(self.snapshot_index, |s| s.prev_index()) + 1
    }

    /// Returns the number of bytes left in the tail segment.
    pub fn remaining_capacity(&self) -> usize {
        self.segments.back().map_or(0, |s| s.remaining())
    }

    /// Returns the term of the entry at the given index, if known. This
    /// includes the snapshot base and the implicit entry 0.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.segment(index)?.term(index)
    }

    /// Returns the segment containing the given index, if any.
    fn segment(&self, index: Index) -> Option<&Segment> {
        let i = self.segments.partition_point(|s| s.last_index() < index);
        self.segments.get(i).filter(|s| s.prev_index() < index)
    }

    /// Checks that an entry fits in a segment, so it can be appended. Oversized
    /// entries are rejected before they are proposed.
    pub fn check_size(&self, entry: &Entry) -> Result<()> {
        let size = entry.encoded_size()? as usize;
        let max = Segment::max_entry_size(self.segment_size);
        if size > max {
            return errinput!("entry size {size} exceeds maximum {max}");
        }
        Ok(())
    }

    /// Appends an entry to the log in the current term, assigning it the next
    /// index, and flushes it to disk. Returns the index.
    pub fn append(&mut self, mut entry: Entry) -> Result<Index> {
        assert!(self.meta.term > 0, "can't append entry in term 0");
        assert_eq!(entry.term, self.meta.term, "appended entry must be in current term");
        entry.index = self.last_index + 1;
        self.write(&entry)?;
        self.flush()?;
        Ok(entry.index)
    }

    /// Writes an entry to the tail segment, rolling a new segment if needed.
    fn write(&mut self, entry: &Entry) -> Result<()> {
        assert_eq!(entry.index, self.last_index + 1, "entry index gap");
        self.check_size(entry)?;
        let size = entry.encoded_size()? as usize;
        if !self.segments.back().is_some_and(|s| s.fits(size)) {
            if let Some(tail) = self.segments.back_mut() {
                tail.flush(self.fsync)?;
            }
            let segment = self.create_segment(self.last_index)?;
            info!("Rolled log segment {} at index {}", segment.path().display(), self.last_index);
            self.segments.push_back(segment);
        }
        let Some(tail) = self.segments.back_mut() else { return errdata!("no log segment") };
        tail.append(entry)?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(())
    }

    /// Flushes pending writes to disk.
    pub fn flush(&mut self) -> Result<()> {
        match self.segments.back_mut() {
            Some(tail) => tail.flush(self.fsync),
            None => Ok(()),
        }
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        let Some(term) = self.term_at(index) else {
            return errdata!("commit index {index} does not exist");
        };
        assert!(index >= self.commit_index, "commit index regression {} → {}", self.commit_index, index);
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist or has been
    /// compacted.
    pub fn get(&self, index: Index) -> Result<Option<Entry>> {
        match self.segment(index) {
            Some(segment) => segment.get(index),
            None => Ok(None),
        }
    }

    /// Checks if the log contains an entry with the given index and term. The
    /// snapshot base counts as a match.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Returns an iterator over log entries in the given index range.
    #[cfg(test)]
    pub fn scan(&self, range: impl RangeBounds<Index>) -> Scan<'_> {
        let from = match range.start_bound() {
            Bound::Included(&index) => index,
            Bound::Excluded(&index) => index + 1,
            Bound::Unbounded => self.first_index(),
        };
        let to = match range.end_bound() {
            Bound::Included(&index) => index,
            Bound::Excluded(&index) => index.saturating_sub(1),
            Bound::Unbounded => self.last_index,
        };
        Scan { log: self, next: from.max(1), to: to.min(self.last_index) }
    }

    /// Returns raw, framed entry records starting at the given index, as
    /// slices borrowed from the segment mappings. Stops after max_bytes, but
    /// always returns at least one record if the index exists. Also returns
    /// the last index included (from - 1 if none). Decode the records with
    /// `decode_records()`.
    pub fn raw_range(&self, from: Index, max_bytes: usize) -> (Vec<&[u8]>, Index) {
        let mut chunks: Vec<&[u8]> = Vec::new();
        let mut next = from;
        let mut budget = max_bytes;
        for segment in self.segments.iter().filter(|s| s.last_index() >= from) {
            let Some((bytes, last)) = segment.raw(next, budget) else { break };
            if !chunks.is_empty() && bytes.len() > budget {
                break;
            }
            budget = budget.saturating_sub(bytes.len());
            chunks.push(bytes);
            next = last + 1;
            if budget == 0 || last < segment.last_index() {
                break;
            }
        }
        (chunks, next - 1)
    }

    /// Splices a set of entries into the log. The entries must be contiguous,
    /// and the first entry's index must be at most last_index+1. If an entry
    /// does not exist, append it. If an existing entry has a term mismatch,
    /// replace it and all following entries. Entries already covered by the
    /// snapshot are skipped.
    ///
    /// Returns the last index in the log.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index);
        };
        if first.index == 0 || first.term == 0 {
            return errdata!("spliced entries can't have index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            return errdata!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            return errdata!("spliced entries have term regression");
        }
        if last.term > self.meta.term {
            return errdata!("spliced entries from future term {}", last.term);
        }
        if first.index > self.last_index + 1 {
            return errdata!("spliced entries start at {} after last index {}", first.index, self.last_index);
        }

        // Skip entries that are already in the log.
        let mut entries = entries.as_slice();
        while let Some(entry) = entries.first() {
            if entry.index > self.snapshot_index && !self.has(entry.index, entry.term) {
                break;
            }
            entries = &entries[1..];
        }
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the entries that aren't already in the log, replacing any
        // conflicting tail.
        assert!(first.index > self.commit_index, "spliced entries below commit index");
        self.remove_from(first.index)?;
        for entry in entries {
            self.write(entry)?;
        }
        self.flush()?;
        Ok(self.last_index)
    }

    /// Removes all entries at and after the given index. Used for conflict
    /// resolution, and never for committed entries.
    pub fn remove_from(&mut self, index: Index) -> Result<()> {
        assert!(index > self.commit_index, "can't remove committed entry {index}");
        if index > self.last_index {
            return Ok(());
        }
        while self.segments.len() > 1 && self.segments.back().is_some_and(|s| s.prev_index() >= index) {
            self.segments.pop_back().into_iter().try_for_each(Segment::delete)?;
        }
        if let Some(tail) = self.segments.back_mut() {
            tail.truncate(index);
            tail.flush(self.fsync)?;
        }
        self.last_index = index - 1;
        match self.term_at(self.last_index) {
            Some(term) => self.last_term = term,
            None => return errdata!("missing term for index {}", self.last_index),
        }
        Ok(())
    }

    /// Returns true if a snapshot at the given applied index would allow the
    /// first segment to be deleted.
    pub fn should_compact(&self, applied_index: Index) -> bool {
        self.segments.len() > 1
            && self.segments.front().is_some_and(|s| s.last_index() <= applied_index)
    }

    /// Records a new snapshot and deletes the segments it fully covers. The
    /// tail segment is always kept. Returns the number of deleted segments.
    pub fn compact(&mut self, index: Index, term: Term) -> Result<usize> {
        assert!(index <= self.commit_index, "snapshot index {index} beyond commit index");
        assert!(index >= self.snapshot_index, "snapshot index regression");
        self.snapshot_index = index;
        self.snapshot_term = term;
        let mut removed = 0;
        while self.segments.len() > 1 && self.segments.front().is_some_and(|s| s.last_index() <= index) {
            self.segments.pop_front().into_iter().try_for_each(Segment::delete)?;
            removed += 1;
        }
        if removed > 0 {
            info!("Compacted {removed} log segments up to index {index}");
        }
        Ok(removed)
    }

    /// Resets the log to start after an installed snapshot. If the log
    /// contains the snapshot's last entry, the following entries are
    /// retained. Otherwise, the entire log is discarded.
    pub fn reset(&mut self, index: Index, term: Term) -> Result<()> {
        if index <= self.last_index && self.has(index, term) {
            self.commit_index = self.commit_index.max(index);
            self.commit_term = self.term_at(self.commit_index).unwrap_or(term);
            self.compact(index, term)?;
            return Ok(());
        }
        while let Some(segment) = self.segments.pop_front() {
            segment.delete()?;
        }
        let segment = self.create_segment(index)?;
        self.segments.push_back(segment);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.last_index = index;
        self.last_term = term;
        self.commit_index = index;
        self.commit_term = term;
        info!("Reset log to snapshot at index {index} term {term}");
        Ok(())
    }

    /// Returns log storage status.
    pub fn status(&self) -> Status {
        Status {
            segments: self.segments.len(),
            snapshot_index: self.snapshot_index,
            last_index: self.last_index,
            commit_index: self.commit_index,
            remaining: self.remaining_capacity(),
        }
    }
}

/// An iterator over log entries.
#[cfg(test)]
pub struct Scan<'a> {
    log: &'a Log,
    next: Index,
    to: Index,
}

#[cfg(test)]
impl Iterator for Scan<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.to {
            return None;
        }
        let result = self.log.get(self.next).transpose();
        self.next += 1;
        result
    }
}
