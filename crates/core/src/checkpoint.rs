//! Checkpoint storage boundary
//!
//! The bridge writes one opaque frame per checkpoint and reads exactly that
//! frame back on reset. Hosts plug in their own storage by implementing
//! [`CheckpointSink`] and [`CheckpointSource`]; two implementations ship here.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Append side of checkpoint storage
pub trait CheckpointSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Read side of checkpoint storage
pub trait CheckpointSource {
    fn read_bytes(&mut self) -> Result<Vec<u8>>;
}

/// FIFO of frames held in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpoint {
    frames: VecDeque<Vec<u8>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl CheckpointSink for MemoryCheckpoint {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.frames.push_back(bytes.to_vec());
        Ok(())
    }
}

impl CheckpointSource for MemoryCheckpoint {
    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.frames
            .pop_front()
            .ok_or_else(|| Error::Checkpoint("no checkpoint frame available".to_string()))
    }
}

/// One checkpoint as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub stage: String,
    pub sequence: u64,
    /// Hex SHA-256 of `payload`
    pub digest: String,
    pub payload: Vec<u8>,
}

impl CheckpointRecord {
    pub fn new(stage: &str, sequence: u64, payload: Vec<u8>) -> Self {
        CheckpointRecord {
            stage: stage.to_string(),
            sequence,
            digest: hex::encode(Sha256::digest(&payload)),
            payload,
        }
    }

    pub fn verify(&self) -> Result<()> {
        let actual = hex::encode(Sha256::digest(&self.payload));
        if actual != self.digest {
            return Err(Error::Checkpoint(format!(
                "digest mismatch for stage '{}' sequence {}: stored {}, computed {}",
                self.stage, self.sequence, self.digest, actual
            )));
        }
        Ok(())
    }
}

/// Directory of `<stage>-<sequence>.ckpt` files
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(FileCheckpointStore { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, stage: &str, sequence: u64) -> PathBuf {
        self.directory.join(format!("{}-{:020}.ckpt", stage, sequence))
    }

    pub fn sink(&self, stage: &str, sequence: u64) -> FileCheckpointSink {
        FileCheckpointSink {
            store: self.clone(),
            stage: stage.to_string(),
            sequence,
        }
    }

    pub fn source(&self, stage: &str, sequence: u64) -> FileCheckpointSource {
        FileCheckpointSource {
            path: self.path_for(stage, sequence),
            stage: stage.to_string(),
            sequence,
        }
    }

    /// Highest sequence stored for `stage`
    pub fn latest(&self, stage: &str) -> Result<Option<u64>> {
        let prefix = format!("{}-", stage);
        let mut latest = None;
        for entry in fs::read_dir(&self.directory)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let sequence = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".ckpt"))
                .and_then(|seq| seq.parse::<u64>().ok());
            if let Some(seq) = sequence {
                latest = latest.max(Some(seq));
            }
        }
        Ok(latest)
    }

    fn write_record(&self, record: &CheckpointRecord) -> Result<()> {
        let encoded = bincode::serialize(record)?;
        let target = self.path_for(&record.stage, record.sequence);
        let staging = self
            .directory
            .join(format!(".{}.{}.tmp", record.stage, uuid::Uuid::new_v4()));
        fs::write(&staging, &encoded)?;
        fs::rename(&staging, &target)?;
        tracing::debug!(
            stage = %record.stage,
            sequence = record.sequence,
            bytes = record.payload.len(),
            path = %target.display(),
            "Wrote checkpoint"
        );
        Ok(())
    }
}

pub struct FileCheckpointSink {
    store: FileCheckpointStore,
    stage: String,
    sequence: u64,
}

impl CheckpointSink for FileCheckpointSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let record = CheckpointRecord::new(&self.stage, self.sequence, bytes.to_vec());
        self.store.write_record(&record)
    }
}

pub struct FileCheckpointSource {
    path: PathBuf,
    stage: String,
    sequence: u64,
}

impl CheckpointSource for FileCheckpointSource {
    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let encoded = fs::read(&self.path).map_err(|e| {
            Error::Checkpoint(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let record: CheckpointRecord = bincode::deserialize(&encoded)?;
        if record.stage != self.stage || record.sequence != self.sequence {
            return Err(Error::Checkpoint(format!(
                "{} holds stage '{}' sequence {}, expected '{}' sequence {}",
                self.path.display(),
                record.stage,
                record.sequence,
                self.stage,
                self.sequence
            )));
        }
        record.verify()?;
        Ok(record.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_checkpoint_is_fifo() {
        let mut store = MemoryCheckpoint::new();
        store.write_bytes(b"one").unwrap();
        store.write_bytes(b"").unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read_bytes().unwrap(), b"one");
        assert_eq!(store.read_bytes().unwrap(), b"");
        assert!(store.read_bytes().is_err());
    }

    #[test]
    fn test_record_digest() {
        let record = CheckpointRecord::new("counter", 3, b"state".to_vec());
        record.verify().unwrap();

        let mut tampered = record.clone();
        tampered.payload[0] ^= 0xff;
        assert!(matches!(tampered.verify(), Err(Error::Checkpoint(_))));
    }
}
