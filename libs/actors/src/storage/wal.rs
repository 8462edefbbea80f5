//! WAL Segments
//!
//! A storage directory holds numbered append-only segments `<n>.wal` and at
//! most one `compact.tmp`. Each record is one frame:
//!
//! ```text
//! ┌──────────┬────────────┬──────────────────┐
//! │ len u32  │ crc32 u32  │ bincode(record)  │
//! └──────────┴────────────┴──────────────────┘
//! ```
//!
//! Loading reads every segment in numeric order. A frame that is cut short
//! or fails its checksum ends that segment: the records before it are kept
//! and the loss is logged. New records always go to a fresh segment, so a
//! dirty tail is never appended after. The same holds for a failed append:
//! the next record starts a new segment.
//!
//! How far an append reaches before it returns is set by `WalSyncMode`:
//! the OS page cache (`flush`), `sync_data` (`data`) or `sync_all` (`all`).

use super::compactor::{self, CompactPlan};
use crate::error::StorageError;
use crate::state::WalRecord;
use actor_config::{StorageSettings, WalSyncMode};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on one record, anything larger is treated as corruption
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

pub const SEGMENT_EXTENSION: &str = "wal";

pub fn segment_path(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("{}.{}", num, SEGMENT_EXTENSION))
}

pub fn encode_frame(record: &WalRecord) -> StorageResult<Vec<u8>> {
    let body = bincode::serialize(record).map_err(|e| StorageError::Encode {
        message: e.to_string(),
    })?;
    let length = u32::try_from(body.len()).map_err(|_| StorageError::Encode {
        message: format!("record of {} bytes exceeds frame limit", body.len()),
    })?;
    let crc = crc32fast::hash(&body);

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode consecutive frames from `data`. Returns the records read and, when
/// the data does not end on a clean frame boundary, the reason.
pub fn decode_frames(path: &Path, data: &[u8]) -> (Vec<WalRecord>, Option<StorageError>) {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let remaining = &data[offset..];
        if remaining.len() < FRAME_HEADER_LEN {
            return (
                records,
                Some(StorageError::dirty(path, offset as u64, "truncated frame header")),
            );
        }
        let length = u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]) as usize;
        let expected_crc = u32::from_le_bytes([remaining[4], remaining[5], remaining[6], remaining[7]]);
        if length > MAX_RECORD_BYTES {
            return (
                records,
                Some(StorageError::dirty(
                    path,
                    offset as u64,
                    format!("frame length {} out of range", length),
                )),
            );
        }
        let Some(body) = remaining.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + length) else {
            return (
                records,
                Some(StorageError::dirty(path, offset as u64, "truncated frame body")),
            );
        };
        if crc32fast::hash(body) != expected_crc {
            return (
                records,
                Some(StorageError::dirty(path, offset as u64, "checksum mismatch")),
            );
        }
        match bincode::deserialize::<WalRecord>(body) {
            Ok(record) => records.push(record),
            Err(e) => {
                return (
                    records,
                    Some(StorageError::dirty(
                        path,
                        offset as u64,
                        format!("undecodable record: {}", e),
                    )),
                )
            }
        }
        offset += FRAME_HEADER_LEN + length;
    }
    (records, None)
}

/// Records of one segment, the dirty tail dropped with a warning
pub fn read_segment(path: &Path) -> StorageResult<Vec<WalRecord>> {
    let data = fs::read(path).map_err(|e| StorageError::io(path, e))?;
    let (records, dirty) = decode_frames(path, &data);
    if let Some(e) = dirty {
        warn!(
            path = %path.display(),
            kept = records.len(),
            error = %e,
            "Dirty log, records after the bad frame are lost"
        );
    }
    Ok(records)
}

/// Segment numbers present in `dir`, ascending
pub fn list_segments(dir: &Path) -> StorageResult<Vec<u64>> {
    let mut nums = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))? {
        let entry = entry.map_err(|e| StorageError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        if let Some(num) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            nums.push(num);
        }
    }
    nums.sort_unstable();
    Ok(nums)
}

fn open_segment(path: &Path) -> StorageResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::io(path, e))
}

fn sync_segment(file: &File, mode: WalSyncMode) -> std::io::Result<()> {
    match mode {
        WalSyncMode::Flush => Ok(()),
        WalSyncMode::Data => file.sync_data(),
        WalSyncMode::All => file.sync_all(),
    }
}

/// Snapshot of the log counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WalStats {
    pub current_segment: u64,
    pub wal_size: u64,
    pub non_current_wal_size: u64,
}

/// Append side of the log
pub struct WalStorage {
    dir: PathBuf,
    current_num: u64,
    current: File,
    current_wal_size: u64,
    non_current_wal_size: u64,
    sync_mode: WalSyncMode,
    /// Last append failed, the current segment may end in a torn frame
    broken: bool,
}

impl std::fmt::Debug for WalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalStorage")
            .field("dir", &self.dir)
            .field("current_num", &self.current_num)
            .field("current_wal_size", &self.current_wal_size)
            .field("non_current_wal_size", &self.non_current_wal_size)
            .field("sync_mode", &self.sync_mode)
            .field("broken", &self.broken)
            .finish()
    }
}

impl WalStorage {
    /// Open `dir`, finishing or discarding an interrupted compaction, and
    /// return the storage together with every record found.
    pub fn open(dir: &Path, sync_mode: WalSyncMode) -> StorageResult<(Self, Vec<WalRecord>)> {
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        compactor::recover(dir)?;

        let nums = list_segments(dir)?;
        let mut records = Vec::new();
        for num in &nums {
            let path = segment_path(dir, *num);
            let segment = read_segment(&path)?;
            debug!(path = %path.display(), records = segment.len(), "Loaded segment");
            records.extend(segment);
        }

        let current_num = nums.last().map(|n| n + 1).unwrap_or(1);
        let current = open_segment(&segment_path(dir, current_num))?;
        info!(
            dir = %dir.display(),
            segments = nums.len(),
            records = records.len(),
            current_segment = current_num,
            ?sync_mode,
            "Storage opened"
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                current_num,
                current,
                current_wal_size: 0,
                non_current_wal_size: records.len() as u64,
                sync_mode,
                broken: false,
            },
            records,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one record. On error nothing counts as written and the
    /// caller must not apply the record.
    pub fn append(&mut self, record: &WalRecord) -> StorageResult<()> {
        let frame = encode_frame(record)?;
        if self.broken {
            self.rotate()?;
            info!(current_segment = self.current_num, "Resumed on a new segment after a failed append");
        }
        let written = self
            .current
            .write_all(&frame)
            .and_then(|_| sync_segment(&self.current, self.sync_mode));
        if let Err(e) = written {
            self.broken = true;
            return Err(StorageError::io(segment_path(&self.dir, self.current_num), e));
        }
        self.current_wal_size += 1;
        Ok(())
    }

    fn rotate(&mut self) -> StorageResult<()> {
        let next_num = self.current_num + 1;
        self.current = open_segment(&segment_path(&self.dir, next_num))?;
        self.current_num = next_num;
        self.non_current_wal_size += self.current_wal_size;
        self.current_wal_size = 0;
        self.broken = false;
        Ok(())
    }

    pub fn sync_mode(&self) -> WalSyncMode {
        self.sync_mode
    }

    pub fn wal_size(&self) -> u64 {
        self.non_current_wal_size + self.current_wal_size
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            current_segment: self.current_num,
            wal_size: self.wal_size(),
            non_current_wal_size: self.non_current_wal_size,
        }
    }

    /// Whether the log has grown enough past the live state to compact
    pub fn should_compact(&self, live_size: u64, settings: &StorageSettings) -> bool {
        let wal_size = self.wal_size();
        wal_size > settings.compact_min_records
            && (wal_size >= settings.compact_ratio.saturating_mul(live_size)
                || wal_size.saturating_sub(live_size) > settings.compact_max_delta)
    }

    /// Rotate to a new segment and plan rewriting everything before it as
    /// `records`. Runs under the queue lock, so the plan and the rotation
    /// see the same state.
    pub fn prepare_compaction(&mut self, records: Vec<WalRecord>) -> StorageResult<CompactPlan> {
        let target_num = self.current_num;
        let segments = list_segments(&self.dir)?
            .into_iter()
            .filter(|num| *num <= target_num)
            .map(|num| segment_path(&self.dir, num))
            .collect();

        self.rotate()?;
        debug!(target_num, next_num = self.current_num, "Rotated for compaction");

        Ok(CompactPlan {
            dir: self.dir.clone(),
            target_num,
            segments,
            records,
        })
    }

    /// Account for a finished compaction whose rewritten segment holds
    /// `dump_len` records
    pub fn commit_compaction(&mut self, dump_len: u64) {
        self.non_current_wal_size = dump_len;
        info!(
            wal_size = self.wal_size(),
            current_segment = self.current_num,
            "Compaction committed"
        );
    }
}

#[cfg(test)]
impl WalStorage {
    /// Swap the current segment for a read-only handle so the next write fails
    pub(crate) fn break_current_segment(&mut self) {
        let path = segment_path(&self.dir, self.current_num);
        self.current = File::open(path).unwrap();
    }
}
