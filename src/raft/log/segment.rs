use super::{Entry, Index};
use crate::encoding::Value as _;
use crate::error::Result;
use crate::errdata;
use crate::raft::Term;

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Identifies a segment file.
const MAGIC: &[u8; 4] = b"TRLS";

/// The segment header: magic followed by the little-endian prev_index.
pub const HEADER_SIZE: usize = 12;

/// Precedes each entry record, followed by a little-endian u32 length and the
/// Bincode-encoded entry.
const ENTRY_MARKER: u8 = 0x01;

/// The record header size: marker and length.
pub const RECORD_HEADER_SIZE: usize = 5;

/// Marks the end of the written records. It is followed by a little-endian
/// CRC32 of every byte before the marker.
const END_MARKER: u8 = 0x00;

/// The footer size: end marker and checksum.
pub const FOOTER_SIZE: usize = 5;

/// A log segment: a fixed-capacity, memory-mapped file containing a contiguous
/// run of entries (prev_index, prev_index + N]. The file is preallocated at
/// creation, and has the following layout:
///
/// ```text
/// | MAGIC | prev_index | 0x01 len entry | 0x01 len entry | ... | 0x00 crc32 | zeroes |
/// ```
///
/// Every append overwrites the previous footer with the new record and writes
/// a new footer after it, with the checksum covering all bytes written so far.
/// A write that is torn by a crash thus leaves a segment whose footer doesn't
/// verify, and the segment is discarded on open.
pub struct Segment {
    path: PathBuf,
    /// Kept open for the lifetime of the mapping.
    _file: File,
    map: MmapMut,
    prev_index: Index,
    /// The byte offset and term of each entry, in index order.
    entries: Vec<(usize, Term)>,
    /// The write position, i.e. the offset of the footer.
    end: usize,
    /// Running checksum of map[..end].
    hasher: crc32fast::Hasher,
    /// The lowest offset written since the last flush, if any.
    dirty_from: Option<usize>,
}

impl Segment {
    /// Creates a new, empty segment file with the given capacity in bytes.
    pub fn create(path: &Path, prev_index: Index, capacity: usize) -> Result<Self> {
        if capacity < HEADER_SIZE + FOOTER_SIZE + RECORD_HEADER_SIZE {
            return errdata!("segment capacity {capacity} too small");
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity as u64)?;
        let mut map = unsafe { MmapOptions::new().len(capacity).map_mut(&file)? };

        map[..4].copy_from_slice(MAGIC);
        map[4..HEADER_SIZE].copy_from_slice(&prev_index.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&map[..HEADER_SIZE]);

        let mut segment = Self {
            path: path.to_path_buf(),
            _file: file,
            map,
            prev_index,
            entries: Vec::new(),
            end: HEADER_SIZE,
            hasher,
            dirty_from: Some(0),
        };
        segment.write_footer();
        segment.flush(true)?;
        Ok(segment)
    }

    /// Opens an existing segment file, verifying its checksum. Returns an
    /// InvalidData error if the segment is corrupt or torn.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = usize::try_from(file.metadata()?.len())?;
        if size < HEADER_SIZE + FOOTER_SIZE {
            return errdata!("segment {} truncated to {size} bytes", path.display());
        }
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        if &map[..4] != MAGIC {
            return errdata!("segment {} has invalid magic", path.display());
        }
        let prev_index = Index::from_le_bytes(map[4..HEADER_SIZE].try_into()?);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&map[..HEADER_SIZE]);
        let mut entries = Vec::new();
        let mut pos = HEADER_SIZE;
        loop {
            if pos + FOOTER_SIZE > size {
                return errdata!("segment {} has no footer", path.display());
            }
            match map[pos] {
                END_MARKER => {
                    let crc = u32::from_le_bytes(map[pos + 1..pos + FOOTER_SIZE].try_into()?);
                    if crc != hasher.clone().finalize() {
                        return errdata!("segment {} checksum mismatch", path.display());
                    }
                    break;
                }
                ENTRY_MARKER => {
                    let len = u32::from_le_bytes(map[pos + 1..pos + RECORD_HEADER_SIZE].try_into()?);
                    let next = pos + RECORD_HEADER_SIZE + len as usize;
                    if next + FOOTER_SIZE > size {
                        return errdata!("segment {} record at {pos} overflows", path.display());
                    }
                    let entry = Entry::decode(&map[pos + RECORD_HEADER_SIZE..next])?;
                    let expect = prev_index + entries.len() as Index + 1;
                    if entry.index != expect {
                        return errdata!(
                            "segment {} has index {} at {pos}, expected {expect}",
                            path.display(),
                            entry.index
                        );
                    }
                    hasher.update(&map[pos..next]);
                    entries.push((pos, entry.term));
                    pos = next;
                }
                marker => {
                    return errdata!("segment {} has invalid marker {marker:#x}", path.display())
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            map,
            prev_index,
            entries,
            end: pos,
            hasher,
            dirty_from: None,
        })
    }

    /// Returns the segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the index preceding the first entry in the segment.
    pub fn prev_index(&self) -> Index {
        self.prev_index
    }

    /// Returns the index of the last entry, or prev_index if empty.
    pub fn last_index(&self) -> Index {
        self.prev_index + self.entries.len() as Index
    }

    /// Returns the term of the last entry, if any.
    #[cfg(test)]
    pub fn last_term(&self) -> Option<Term> {
        self.entries.last().map(|(_, term)| *term)
    }

    /// Returns the number of bytes available for entry records.
    pub fn remaining(&self) -> usize {
        self.map.len().saturating_sub(self.end + FOOTER_SIZE)
    }

    /// Returns the largest entry encoding that fits in an empty segment with
    /// the given capacity.
    pub fn max_entry_size(capacity: usize) -> usize {
        capacity.saturating_sub(HEADER_SIZE + FOOTER_SIZE + RECORD_HEADER_SIZE)
    }

    /// Returns true if a record with the given encoded entry size fits.
    pub fn fits(&self, size: usize) -> bool {
        RECORD_HEADER_SIZE + size <= self.remaining()
    }

    /// Returns the term of the entry at the given index, if present.
    pub fn term(&self, index: Index) -> Option<Term> {
        self.position(index).map(|i| self.entries[i].1)
    }

    /// Fetches the entry at the given index, if present.
    pub fn get(&self, index: Index) -> Result<Option<Entry>> {
        let Some(i) = self.position(index) else { return Ok(None) };
        let (offset, _) = self.entries[i];
        let len = u32::from_le_bytes(self.map[offset + 1..offset + RECORD_HEADER_SIZE].try_into()?);
        let start = offset + RECORD_HEADER_SIZE;
        Entry::decode(&self.map[start..start + len as usize]).map(Some)
    }

    /// Returns the raw, framed records starting at the given index, borrowed
    /// from the mapping, along with the last included index. Records are
    /// included until max_bytes is reached, but the first record is always
    /// included. The caller can decode them with `decode_records()`.
    pub fn raw(&self, from: Index, max_bytes: usize) -> Option<(&[u8], Index)> {
        let first = self.position(from)?;
        let start = self.entries[first].0;
        // A record ends where the next one starts, or at the footer.
        let record_end = |i: usize| self.entries.get(i + 1).map_or(self.end, |(offset, _)| *offset);
        let mut last = first;
        while last + 1 < self.entries.len() && record_end(last + 1) - start <= max_bytes {
            last += 1;
        }
        Some((&self.map[start..record_end(last)], self.prev_index + last as Index + 1))
    }

    /// Appends an entry. The caller must ensure that the index follows the
    /// last index and that the entry fits.
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        assert_eq!(entry.index, self.last_index() + 1, "entry index gap");
        let bytes = entry.encode()?;
        if !self.fits(bytes.len()) {
            return errdata!("entry {} does not fit in segment", entry.index);
        }
        let pos = self.end;
        let next = pos + RECORD_HEADER_SIZE + bytes.len();
        self.map[pos] = ENTRY_MARKER;
        self.map[pos + 1..pos + RECORD_HEADER_SIZE]
            .copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.map[pos + RECORD_HEADER_SIZE..next].copy_from_slice(&bytes);
        self.hasher.update(&self.map[pos..next]);
        self.entries.push((pos, entry.term));
        self.end = next;
        self.dirty_from = Some(self.dirty_from.map_or(pos, |d| d.min(pos)));
        self.write_footer();
        Ok(())
    }

    /// Removes all entries at or after the given index, and rewrites the
    /// footer. The checksum is recomputed from scratch.
    pub fn truncate(&mut self, from: Index) {
        let Some(i) = self.position(from) else { return };
        self.end = self.entries[i].0;
        self.entries.truncate(i);
        self.hasher = crc32fast::Hasher::new();
        self.hasher.update(&self.map[..self.end]);
        self.dirty_from = Some(self.dirty_from.map_or(self.end, |d| d.min(self.end)));
        self.write_footer();
    }

    /// Flushes any dirty bytes to disk. If sync is false, the flush is
    /// initiated but not waited for.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        if let Some(from) = self.dirty_from.take() {
            let len = (self.end + FOOTER_SIZE).min(self.map.len()) - from;
            match sync {
                true => self.map.flush_range(from, len)?,
                false => self.map.flush_async_range(from, len)?,
            }
        }
        Ok(())
    }

    /// Closes the segment and removes its file.
    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Returns the position of the given index in self.entries.
    fn position(&self, index: Index) -> Option<usize> {
        if index <= self.prev_index || index > self.last_index() {
            return None;
        }
        Some((index - self.prev_index - 1) as usize)
    }

    /// Writes the end marker and checksum at the write position.
    fn write_footer(&mut self) {
        let crc = self.hasher.clone().finalize();
        self.map[self.end] = END_MARKER;
        self.map[self.end + 1..self.end + FOOTER_SIZE].copy_from_slice(&crc.to_le_bytes());
    }
}

/// Decodes framed records as returned by `Segment::raw()`.
pub fn decode_records(mut bytes: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < RECORD_HEADER_SIZE {
            return errdata!("truncated record header");
        }
        match bytes[0] {
            ENTRY_MARKER => {}
            END_MARKER => break,
            marker => return errdata!("invalid record marker {marker:#x}"),
        }
        let len = u32::from_le_bytes(bytes[1..RECORD_HEADER_SIZE].try_into()?) as usize;
        let Some(record) = bytes.get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len) else {
            return errdata!("truncated record of {len} bytes");
        };
        entries.push(Entry::decode(record)?);
        bytes = &bytes[RECORD_HEADER_SIZE + len..];
    }
    Ok(entries)
}
