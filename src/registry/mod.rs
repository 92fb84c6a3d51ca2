// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory download registry.
//!
//! The registry is the exclusive owner of every [`DownloadTask`] and
//! [`ExtractionTask`]. All access goes through one `RwLock`, which gives
//! global serialization of updates; task counts are in the hundreds at most.
//! Reads hand out clones, so callers never observe a record mid-mutation.
//!
//! [`Registry::update`] runs the mutator against a copy and commits only if
//! it returns `Ok`, which makes every update all-or-nothing.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::error::{HarvestError, HarvestResult};
use crate::sync::{resilient_read, resilient_write};
use crate::types::{
    DownloadFilter, DownloadStatus, DownloadTask, ExtractionStatus, ExtractionTask,
};

#[derive(Debug, Default)]
struct RegistryState {
    /// Download tasks keyed by id, in insertion order
    downloads: IndexMap<String, DownloadTask>,
    /// Extraction tasks keyed by id, in insertion order
    extractions: IndexMap<String, ExtractionTask>,
}

/// Counts of downloads per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub removed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.queued + self.active + self.paused + self.completed + self.failed + self.removed
    }
}

/// Shared store for download and extraction tasks.
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Insert a new task. Fails with `DuplicateId` if the id is taken.
    pub fn insert(&self, task: DownloadTask) -> HarvestResult<()> {
        let mut state = resilient_write(&self.state);
        if state.downloads.contains_key(&task.id) {
            return Err(HarvestError::DuplicateId(task.id));
        }
        state.downloads.insert(task.id.clone(), task);
        Ok(())
    }

    /// Get a copy of a task.
    pub fn get(&self, id: &str) -> Option<DownloadTask> {
        resilient_read(&self.state).downloads.get(id).cloned()
    }

    /// Snapshot of matching tasks in insertion order.
    pub fn list(&self, filter: &DownloadFilter) -> Vec<DownloadTask> {
        resilient_read(&self.state)
            .downloads
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    /// Ids of every tracked download, in insertion order.
    pub fn ids(&self) -> Vec<String> {
        resilient_read(&self.state).downloads.keys().cloned().collect()
    }

    /// Find the task currently attached to an engine GID.
    pub fn find_by_engine_gid(&self, gid: &str) -> Option<DownloadTask> {
        resilient_read(&self.state)
            .downloads
            .values()
            .find(|task| task.engine_gid == gid)
            .cloned()
    }

    /// Atomic read-modify-write of a single task.
    ///
    /// The mutator receives a copy; the copy replaces the stored record only
    /// when the mutator returns `Ok`. Returns the committed task together with
    /// the mutator's value.
    pub fn update<R, F>(&self, id: &str, mutator: F) -> HarvestResult<(DownloadTask, R)>
    where
        F: FnOnce(&mut DownloadTask) -> HarvestResult<R>,
    {
        let mut state = resilient_write(&self.state);
        let stored = state
            .downloads
            .get_mut(id)
            .ok_or_else(|| HarvestError::download_not_found(id))?;

        let mut draft = stored.clone();
        let value = mutator(&mut draft)?;
        // Registry keys never change under a mutator.
        draft.id = stored.id.clone();
        if let Some(total) = draft.total_bytes {
            draft.progress_bytes = draft.progress_bytes.min(total);
        }
        *stored = draft.clone();
        Ok((draft, value))
    }

    /// Remove a task, returning it.
    pub fn remove(&self, id: &str) -> HarvestResult<DownloadTask> {
        resilient_write(&self.state)
            .downloads
            .shift_remove(id)
            .ok_or_else(|| HarvestError::download_not_found(id))
    }

    /// Drop completed and failed tasks last updated before `cutoff`.
    ///
    /// Returns the ids that were purged.
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut state = resilient_write(&self.state);
        let mut purged = Vec::new();
        state.downloads.retain(|id, task| {
            let expired = matches!(task.status, DownloadStatus::Completed | DownloadStatus::Failed)
                && task.updated_at < cutoff;
            if expired {
                purged.push(id.clone());
            }
            !expired
        });
        purged
    }

    /// Get count of tasks by status.
    pub fn status_counts(&self) -> StatusCounts {
        let state = resilient_read(&self.state);
        let mut counts = StatusCounts::default();
        for task in state.downloads.values() {
            match task.status {
                DownloadStatus::Queued => counts.queued += 1,
                DownloadStatus::Active => counts.active += 1,
                DownloadStatus::Paused => counts.paused += 1,
                DownloadStatus::Completed => counts.completed += 1,
                DownloadStatus::Failed => counts.failed += 1,
                DownloadStatus::Removed => counts.removed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.state).downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Extractions
    // ------------------------------------------------------------------

    /// Insert an extraction task unless the same archive is already being
    /// extracted. The check and the insert happen under one lock.
    pub fn insert_extraction(&self, task: ExtractionTask) -> HarvestResult<()> {
        let mut state = resilient_write(&self.state);
        let busy = state.extractions.values().any(|existing| {
            existing.archive_path == task.archive_path && !existing.status.is_terminal()
        });
        if busy {
            return Err(HarvestError::ExtractionInProgress(task.archive_path));
        }
        if state.extractions.contains_key(&task.id) {
            return Err(HarvestError::DuplicateId(task.id));
        }
        state.extractions.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get_extraction(&self, id: &str) -> Option<ExtractionTask> {
        resilient_read(&self.state).extractions.get(id).cloned()
    }

    /// Snapshot of extraction tasks, optionally filtered by status.
    pub fn list_extractions(&self, status: Option<ExtractionStatus>) -> Vec<ExtractionTask> {
        resilient_read(&self.state)
            .extractions
            .values()
            .filter(|task| status.map_or(true, |s| task.status == s))
            .cloned()
            .collect()
    }

    /// Atomic read-modify-write of an extraction task.
    pub fn update_extraction<F>(&self, id: &str, mutator: F) -> HarvestResult<ExtractionTask>
    where
        F: FnOnce(&mut ExtractionTask),
    {
        let mut state = resilient_write(&self.state);
        let stored = state
            .extractions
            .get_mut(id)
            .ok_or_else(|| HarvestError::extraction_not_found(id))?;
        mutator(stored);
        Ok(stored.clone())
    }
}
