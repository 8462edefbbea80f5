//! WAL Compaction
//!
//! Rewrites every segment up to a target as the minimal record sequence of
//! the live state. The write happens outside the queue lock through the
//! reserved `compact.tmp`:
//!
//! 1. write header + frames to `compact.tmp`, fsync
//! 2. delete the old segments except the target
//! 3. rename `compact.tmp` over the target segment
//!
//! A crash after (1) leaves a complete temp file, which the next startup
//! finishes. A crash during (1) leaves an incomplete one, which is deleted
//! while the old segments are still intact.

use super::wal::{decode_frames, encode_frame, list_segments, segment_path, StorageResult};
use crate::error::StorageError;
use crate::state::WalRecord;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const COMPACT_TMP: &str = "compact.tmp";

const COMPACT_MAGIC: &[u8; 8] = b"ACTCMPT1";
const COMPACT_HEADER_LEN: usize = COMPACT_MAGIC.len() + 16;

/// Work captured under the lock, executed outside it
#[derive(Debug)]
pub struct CompactPlan {
    pub dir: PathBuf,
    /// Segment the dump replaces
    pub target_num: u64,
    /// Segments covered by the dump, target included
    pub segments: Vec<PathBuf>,
    pub records: Vec<WalRecord>,
}

impl CompactPlan {
    pub fn tmp_path(&self) -> PathBuf {
        self.dir.join(COMPACT_TMP)
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the temp file and swap it in. On failure the old segments are
    /// left untouched and the temp file removed.
    pub fn execute(&self) -> StorageResult<()> {
        let tmp = self.tmp_path();
        if let Err(e) = self.write_tmp(&tmp) {
            if let Err(remove) = fs::remove_file(&tmp) {
                warn!(path = %tmp.display(), error = %remove, "Failed to remove compaction temp file");
            }
            return Err(e);
        }
        finish(&self.dir, self.target_num, &tmp)?;
        info!(
            target = self.target_num,
            records = self.records.len(),
            replaced = self.segments.len(),
            "Compaction finished"
        );
        Ok(())
    }

    fn write_tmp(&self, tmp: &Path) -> StorageResult<()> {
        let file = File::create(tmp).map_err(|e| StorageError::io(tmp, e))?;
        let mut writer = BufWriter::new(file);
        let mut header = Vec::with_capacity(COMPACT_HEADER_LEN);
        header.extend_from_slice(COMPACT_MAGIC);
        header.extend_from_slice(&self.target_num.to_le_bytes());
        header.extend_from_slice(&self.len().to_le_bytes());
        writer
            .write_all(&header)
            .map_err(|e| StorageError::io(tmp, e))?;
        for record in &self.records {
            writer
                .write_all(&encode_frame(record)?)
                .map_err(|e| StorageError::io(tmp, e))?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| StorageError::io(tmp, e.into_error()))?;
        file.sync_all().map_err(|e| StorageError::io(tmp, e))
    }
}

/// Delete segments up to the target, then move the temp file into place
fn finish(dir: &Path, target_num: u64, tmp: &Path) -> StorageResult<()> {
    for num in list_segments(dir)? {
        if num >= target_num {
            continue;
        }
        let path = segment_path(dir, num);
        fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
    }
    let target = segment_path(dir, target_num);
    fs::rename(tmp, &target).map_err(|e| StorageError::io(&target, e))
}

/// Parse a temp file, `None` unless it is complete
fn read_tmp(tmp: &Path) -> StorageResult<Option<u64>> {
    let data = fs::read(tmp).map_err(|e| StorageError::io(tmp, e))?;
    if data.len() < COMPACT_HEADER_LEN || &data[..COMPACT_MAGIC.len()] != COMPACT_MAGIC {
        return Ok(None);
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&data[8..16]);
    let target_num = u64::from_le_bytes(word);
    word.copy_from_slice(&data[16..24]);
    let count = u64::from_le_bytes(word);

    let (records, dirty) = decode_frames(tmp, &data[COMPACT_HEADER_LEN..]);
    if dirty.is_some() || records.len() as u64 != count {
        return Ok(None);
    }
    Ok(Some(target_num))
}

/// Finish or discard a compaction interrupted by a crash
pub fn recover(dir: &Path) -> StorageResult<()> {
    let tmp = dir.join(COMPACT_TMP);
    if !tmp.exists() {
        return Ok(());
    }
    match read_tmp(&tmp)? {
        Some(target_num) => {
            warn!(target = target_num, "Finishing interrupted compaction");
            finish(dir, target_num, &tmp)
        }
        None => {
            warn!(path = %tmp.display(), "Discarding incomplete compaction");
            fs::remove_file(&tmp).map_err(|e| StorageError::io(&tmp, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::WalStorage;
    use actor_config::WalSyncMode;
    use tempfile::TempDir;
    use types::ActorMessage;

    fn inbox(id: &str) -> WalRecord {
        WalRecord::Inbox {
            message: ActorMessage::new("demo.src", "demo.dst", b"{}".to_vec()).with_id(id),
        }
    }

    fn execute(id: &str) -> WalRecord {
        WalRecord::Execute {
            message_id: id.to_string(),
        }
    }

    #[test]
    fn test_compaction_replaces_old_segments() {
        let dir = TempDir::new().unwrap();
        let (mut wal, _) = WalStorage::open(dir.path(), WalSyncMode::Flush).unwrap();
        wal.append(&inbox("m1")).unwrap();
        wal.append(&execute("m1")).unwrap();
        wal.append(&inbox("m2")).unwrap();

        let plan = wal.prepare_compaction(vec![inbox("m2")]).unwrap();
        // appended while the plan runs, lands after the target
        wal.append(&execute("m2")).unwrap();
        plan.execute().unwrap();
        wal.commit_compaction(plan.len());
        assert_eq!(wal.wal_size(), 2);
        assert!(!plan.tmp_path().exists());
        drop(wal);

        let (_, records) = WalStorage::open(dir.path(), WalSyncMode::Flush).unwrap();
        assert_eq!(records, vec![inbox("m2"), execute("m2")]);
    }

    #[test]
    fn test_recover_complete_tmp() {
        let dir = TempDir::new().unwrap();
        let (mut wal, _) = WalStorage::open(dir.path(), WalSyncMode::Flush).unwrap();
        wal.append(&inbox("m1")).unwrap();
        wal.append(&execute("m1")).unwrap();
        let plan = wal.prepare_compaction(vec![inbox("m9")]).unwrap();
        drop(wal);

        // crash between fsync and rename
        plan.write_tmp(&plan.tmp_path()).unwrap();
        recover(dir.path()).unwrap();
        assert!(!plan.tmp_path().exists());

        let (_, records) = WalStorage::open(dir.path(), WalSyncMode::Flush).unwrap();
        assert_eq!(records, vec![inbox("m9")]);
    }

    #[test]
    fn test_recover_discards_incomplete_tmp() {
        let dir = TempDir::new().unwrap();
        let (mut wal, _) = WalStorage::open(dir.path(), WalSyncMode::Flush).unwrap();
        wal.append(&inbox("m1")).unwrap();
        let plan = wal
            .prepare_compaction(vec![inbox("m7"), inbox("m8")])
            .unwrap();
        drop(wal);

        plan.write_tmp(&plan.tmp_path()).unwrap();
        let data = fs::read(plan.tmp_path()).unwrap();
        fs::write(plan.tmp_path(), &data[..data.len() - 3]).unwrap();

        let (_, records) = WalStorage::open(dir.path(), WalSyncMode::Flush).unwrap();
        assert_eq!(records, vec![inbox("m1")]);
        assert!(!plan.tmp_path().exists());
    }
}
