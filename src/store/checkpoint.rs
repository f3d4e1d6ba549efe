//! Durable checkpoint storage.
//!
//! Each task gets its own directory under `<data_dir>/checkpoints/`, with
//! one JSON file per checkpoint named by sequence number. Writes go to a
//! temporary file first and are renamed into place, so a crash mid-write
//! never corrupts an existing checkpoint. Loads walk backwards from the
//! highest sequence, skipping files that fail to parse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

/// A point-in-time snapshot of one task's progress.
///
/// The snapshot payload is opaque to the engine; callers store whatever
/// their executor needs to resume (partial output, cursor positions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    /// Monotonically increasing per task, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Opaque caller payload.
    pub snapshot: serde_json::Value,
    /// Whether work may resume from this checkpoint.
    pub resumable: bool,
}

/// File-backed checkpoint store rooted at one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open a store rooted at `<data_dir>/checkpoints`, creating it if
    /// needed.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join("checkpoints");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn checkpoint_path(&self, task_id: TaskId, sequence: u64) -> PathBuf {
        self.task_dir(task_id).join(format!("{sequence}.json"))
    }

    /// Save a snapshot for `task_id`, assigning the next sequence number.
    ///
    /// The file is written to a sibling temp path and renamed into place;
    /// the rename is the commit point.
    pub fn save(
        &self,
        task_id: TaskId,
        snapshot: serde_json::Value,
        resumable: bool,
    ) -> Result<Checkpoint> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir)?;

        let sequence = self.latest_sequence(task_id)? + 1;
        let checkpoint = Checkpoint {
            task_id,
            sequence,
            timestamp: Utc::now(),
            snapshot,
            resumable,
        };

        let path = self.checkpoint_path(task_id, sequence);
        let tmp = dir.join(format!("{sequence}.json.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(&checkpoint)?)?;
        fs::rename(&tmp, &path)?;
        clog_debug!(
            "Checkpoint {} saved for task {}",
            sequence,
            task_id.short()
        );
        Ok(checkpoint)
    }

    /// Load the most recent checkpoint that parses.
    ///
    /// A corrupt newest file is logged and skipped rather than surfaced, so
    /// a torn write never strands a task. Returns `Ok(None)` when the task
    /// has no usable checkpoint at all.
    pub fn load_latest(&self, task_id: TaskId) -> Result<Option<Checkpoint>> {
        let mut sequences = self.sequences(task_id)?;
        sequences.sort_unstable();

        for sequence in sequences.into_iter().rev() {
            let path = self.checkpoint_path(task_id, sequence);
            match self.read_checkpoint(&path, task_id, sequence) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(err) => {
                    clog_warn!(
                        "Checkpoint {} for task {} unreadable ({}), trying older",
                        sequence,
                        task_id.short(),
                        err
                    );
                }
            }
        }
        Ok(None)
    }

    /// Load one specific checkpoint. Corruption surfaces as an error here;
    /// only `load_latest` falls back.
    pub fn load(&self, task_id: TaskId, sequence: u64) -> Result<Checkpoint> {
        let path = self.checkpoint_path(task_id, sequence);
        if !path.exists() {
            return Err(Error::CheckpointCorruption { task_id, sequence });
        }
        self.read_checkpoint(&path, task_id, sequence)
    }

    fn read_checkpoint(&self, path: &Path, task_id: TaskId, sequence: u64) -> Result<Checkpoint> {
        let bytes = fs::read(path)?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|_| Error::CheckpointCorruption { task_id, sequence })?;
        if checkpoint.task_id != task_id || checkpoint.sequence != sequence {
            return Err(Error::CheckpointCorruption { task_id, sequence });
        }
        Ok(checkpoint)
    }

    /// Delete all but the newest `keep_last` checkpoints for a task.
    pub fn prune(&self, task_id: TaskId, keep_last: usize) -> Result<usize> {
        let mut sequences = self.sequences(task_id)?;
        sequences.sort_unstable();

        let cutoff = sequences.len().saturating_sub(keep_last);
        let mut removed = 0;
        for sequence in &sequences[..cutoff] {
            fs::remove_file(self.checkpoint_path(task_id, *sequence))?;
            removed += 1;
        }
        if removed > 0 {
            clog_debug!(
                "Pruned {} checkpoints for task {}",
                removed,
                task_id.short()
            );
        }
        Ok(removed)
    }

    /// Remove every checkpoint for a task, e.g. after deletion.
    pub fn remove_all(&self, task_id: TaskId) -> Result<()> {
        let dir = self.task_dir(task_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// The highest sequence on disk for a task, 0 when none exist.
    pub fn latest_sequence(&self, task_id: TaskId) -> Result<u64> {
        Ok(self.sequences(task_id)?.into_iter().max().unwrap_or(0))
    }

    fn sequences(&self, task_id: TaskId) -> Result<Vec<u64>> {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sequences = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            // Stray temp files and foreign names are ignored.
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(sequence) = stem.parse::<u64>() {
                    sequences.push(sequence);
                }
            }
        }
        Ok(sequences)
    }
}
