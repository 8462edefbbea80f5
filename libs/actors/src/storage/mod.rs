//! Durable State
//!
//! `DurableState` is the state machine with an optional log observer: a
//! transition is validated, appended to the WAL, and only then applied, so
//! the in-memory state never runs ahead of the log. Without a storage
//! directory the node runs in memory mode and nothing is written.

pub mod compactor;
pub mod wal;

pub use compactor::{CompactPlan, COMPACT_TMP};
pub use wal::{StorageResult, WalStats, WalStorage};

use crate::error::Result;
use crate::state::{ActorState, WalRecord};
use actor_config::{StorageSettings, WalSyncMode};
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct DurableState {
    state: ActorState,
    wal: Option<WalStorage>,
}

impl DurableState {
    pub fn memory(max_complete_size: usize) -> Self {
        Self {
            state: ActorState::new(max_complete_size),
            wal: None,
        }
    }

    /// Open the log in `dir` and replay it. Records that no longer apply
    /// are logged and skipped.
    pub fn open(dir: &Path, max_complete_size: usize, sync_mode: WalSyncMode) -> StorageResult<Self> {
        let (wal, records) = WalStorage::open(dir, sync_mode)?;
        let mut state = ActorState::new(max_complete_size);
        let mut skipped = 0usize;
        for record in &records {
            if let Err(e) = state.apply(record) {
                skipped += 1;
                warn!(kind = record.kind(), error = %e, "Skipping WAL record on replay");
            }
        }
        info!(
            records = records.len(),
            skipped,
            active = state.active_len(),
            "State replayed"
        );
        Ok(Self {
            state,
            wal: Some(wal),
        })
    }

    pub fn state(&self) -> &ActorState {
        &self.state
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    pub fn wal_stats(&self) -> Option<WalStats> {
        self.wal.as_ref().map(WalStorage::stats)
    }

    /// Validate `record`, log it, then apply it. A rejected or unlogged
    /// record leaves the state untouched.
    pub fn apply(&mut self, record: WalRecord) -> Result<()> {
        self.state.check(&record)?;
        if let Some(wal) = self.wal.as_mut() {
            if let Err(e) = wal.append(&record) {
                error!(kind = record.kind(), error = %e, "Failed to append WAL record");
                return Err(e.into());
            }
        }
        self.state.apply(&record)?;
        Ok(())
    }

    pub fn should_compact(&self, settings: &StorageSettings) -> bool {
        match &self.wal {
            Some(wal) => wal.should_compact(self.state.dump_len() as u64, settings),
            None => false,
        }
    }

    pub fn prepare_compaction(&mut self) -> Option<StorageResult<CompactPlan>> {
        let records = self.state.dump();
        self.wal
            .as_mut()
            .map(|wal| wal.prepare_compaction(records))
    }

    pub fn commit_compaction(&mut self, plan: &CompactPlan) {
        if let Some(wal) = self.wal.as_mut() {
            wal.commit_compaction(plan.len());
        }
    }
}
