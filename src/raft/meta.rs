use super::{ClusterRecord, NodeID, NodeRecord, Term};
use crate::encoding::{checksum, Value};
use crate::errinput;
use crate::error::Result;

use log::warn;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::Path;

/// The metadata file name, in the node's data directory.
const META_FILE: &str = "cluster.meta";

/// The temporary metadata file, renamed over META_FILE once written.
const META_TMP_FILE: &str = "cluster.meta.tmp";

/// Durable node metadata: the node's identity, its last known cluster record,
/// and the current term and vote. The term and vote must be persisted before
/// the node acts on them, e.g. before responding to a vote request.
///
/// The file is a Bincode-encoded Metadata followed by a CRC32. Writes go to a
/// temporary file which is synced and then atomically renamed into place, so
/// a crash leaves either the old or the new file. If a crash happens between
/// removing the old file and the rename (on platforms where rename doesn't
/// replace), the temporary file is used instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub node: NodeRecord,
    pub cluster: ClusterRecord,
    pub term: Term,
    pub vote: Option<NodeID>,
}

impl Value for Metadata {}

impl Metadata {
    /// Loads metadata from the given directory. Returns None if there is no
    /// valid metadata file, in which case the node must start from scratch.
    /// Errors if the metadata belongs to a different node or cluster.
    pub fn load(dir: &Path, node: &str, cluster: &str) -> Result<Option<Self>> {
        let meta = match Self::read(&dir.join(META_FILE))? {
            Some(meta) => Some(meta),
            None => Self::read(&dir.join(META_TMP_FILE))?,
        };
        if let Some(meta) = &meta {
            if meta.node.name != node {
                return errinput!("metadata belongs to node {}, not {node}", meta.node.name);
            }
            if meta.cluster.name != cluster {
                return errinput!("metadata belongs to cluster {}, not {cluster}", meta.cluster.name);
            }
        }
        Ok(meta)
    }

    /// Reads and verifies a metadata file. Missing or corrupt files yield None.
    fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(data) = checksum::verify(&bytes) else {
            warn!("Discarding corrupt metadata file {}", path.display());
            return Ok(None);
        };
        match Self::decode(data) {
            Ok(meta) => Ok(Some(meta)),
            Err(err) => {
                warn!("Discarding undecodable metadata file {}: {err}", path.display());
                Ok(None)
            }
        }
    }

    /// Atomically writes the metadata to the given directory.
    pub fn save(&self, dir: &Path, fsync: bool) -> Result<()> {
        let tmp = dir.join(META_TMP_FILE);
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&checksum::append(self.encode()?))?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&tmp, dir.join(META_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::raft::NodeRole;
    use pretty_assertions::assert_eq;

    fn metadata() -> Metadata {
        let node = NodeRecord::new("a", NodeRole::Peer);
        Metadata {
            node: node.clone(),
            cluster: ClusterRecord::new("test", vec![node, NodeRecord::new("b", NodeRole::Peer)]),
            term: 3,
            vote: Some("b".into()),
        }
    }

    #[test]
    fn save_load() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("meta")?;
        assert_eq!(Metadata::load(dir.path(), "a", "test")?, None);

        let meta = metadata();
        meta.save(dir.path(), true)?;
        assert_eq!(Metadata::load(dir.path(), "a", "test")?, Some(meta));
        assert!(!dir.path().join(META_TMP_FILE).exists());
        Ok(())
    }

    #[test]
    fn wrong_identity() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("meta")?;
        metadata().save(dir.path(), false)?;
        assert!(matches!(Metadata::load(dir.path(), "b", "test"), Err(Error::InvalidInput(_))));
        assert!(matches!(Metadata::load(dir.path(), "a", "other"), Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn falls_back_to_tmp() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("meta")?;
        let meta = metadata();
        meta.save(dir.path(), false)?;
        std::fs::rename(dir.path().join(META_FILE), dir.path().join(META_TMP_FILE))?;
        assert_eq!(Metadata::load(dir.path(), "a", "test")?, Some(meta));
        Ok(())
    }

    #[test]
    fn corrupt_is_discarded() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("meta")?;
        metadata().save(dir.path(), false)?;
        let path = dir.path().join(META_FILE);
        let mut bytes = std::fs::read(&path)?;
        bytes[0] ^= 0xff;
        std::fs::write(&path, bytes)?;
        assert_eq!(Metadata::load(dir.path(), "a", "test")?, None);
        Ok(())
    }
}
