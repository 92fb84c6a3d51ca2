// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task types tracked by the registry.
//!
//! These are the orchestration-side records. Engine wire shapes live in
//! [`crate::rpc::types`] and are translated before they reach this module.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Accepted by the engine, waiting for a slot
    Queued,
    /// Transferring
    Active,
    /// Paused by user
    Paused,
    /// Finished successfully
    Completed,
    /// Failed, retry possible
    Failed,
    /// Explicitly removed
    Removed,
}

impl DownloadStatus {
    /// Returns true if no further transfer progress is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Removed)
    }

    /// Whether `self -> next` is an edge of the download state machine.
    ///
    /// ```text
    /// queued -> active <-> paused -> completed
    /// queued | active | paused -> failed
    /// failed -> queued                (retry)
    /// queued | active | paused -> removed
    /// ```
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (Queued, Active) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Active, Completed) | (Paused, Completed) => true,
            (Queued | Active | Paused, Failed) => true,
            (Failed, Queued) => true,
            (Queued | Active | Paused, Removed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown download status '{}'", other)),
        }
    }
}

/// One engine-tracked transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Registry key: the GID the engine issued for the first attempt
    pub id: String,
    /// GID of the current engine attempt (changes on retry)
    pub engine_gid: String,
    /// Mirrors for the same content, in submission order
    pub source_uris: Vec<String>,
    /// Destination relative to the download root ("" for the root itself)
    pub destination_dir: String,
    /// Extra engine options passed at submission
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    pub status: DownloadStatus,
    /// Display name reported by the engine
    pub name: Option<String>,
    pub progress_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second
    pub download_speed: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    /// Create a queued task for a freshly accepted engine transfer.
    pub fn new(
        gid: impl Into<String>,
        source_uris: Vec<String>,
        destination_dir: impl Into<String>,
    ) -> Self {
        let gid = gid.into();
        let now = Utc::now();
        Self {
            id: gid.clone(),
            engine_gid: gid,
            source_uris,
            destination_dir: destination_dir.into(),
            options: serde_json::Map::new(),
            status: DownloadStatus::Queued,
            name: None,
            progress_bytes: 0,
            total_bytes: None,
            download_speed: 0,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach engine options.
    pub fn with_options(mut self, options: serde_json::Map<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    /// Update the status and timestamp.
    pub fn update_status(&mut self, status: DownloadStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Mark as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.download_speed = 0;
        self.update_status(DownloadStatus::Failed);
    }

    /// Get progress percentage (0-100) if the total is known.
    pub fn progress_percent(&self) -> Option<f64> {
        match self.status {
            DownloadStatus::Completed => Some(100.0),
            _ => self.total_bytes.map(|total| {
                if total == 0 {
                    0.0
                } else {
                    (self.progress_bytes as f64 / total as f64) * 100.0
                }
            }),
        }
    }

    /// Estimated seconds remaining at the current speed.
    pub fn eta_seconds(&self) -> Option<u64> {
        let total = self.total_bytes?;
        if self.download_speed == 0 || self.status != DownloadStatus::Active {
            return None;
        }
        Some(total.saturating_sub(self.progress_bytes) / self.download_speed)
    }
}

/// Filter for listing downloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadFilter {
    /// Only tasks in one of these states; empty matches everything
    pub statuses: Vec<DownloadStatus>,
}

impl DownloadFilter {
    /// Match every task.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match tasks in a single state.
    pub fn status(status: DownloadStatus) -> Self {
        Self { statuses: vec![status] }
    }

    pub fn matches(&self, task: &DownloadTask) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&task.status)
    }
}

/// Status of an archive extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExtractionStatus {
    /// Returns true once the job has finished either way.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Archive formats the extractor can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

/// One archive-extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionTask {
    /// Orchestrator-generated id (`ext-` prefix)
    pub id: String,
    /// Archive path relative to the download root
    pub archive_path: String,
    /// Target directory relative to the download root
    pub target_dir: String,
    pub format: ArchiveFormat,
    pub status: ExtractionStatus,
    pub error: Option<String>,
    pub entries_extracted: u64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExtractionTask {
    /// Create a pending extraction job with a fresh id.
    pub fn new(
        archive_path: impl Into<String>,
        target_dir: impl Into<String>,
        format: ArchiveFormat,
    ) -> Self {
        Self {
            id: new_extraction_id(),
            archive_path: archive_path.into(),
            target_dir: target_dir.into(),
            format,
            status: ExtractionStatus::Pending,
            error: None,
            entries_extracted: 0,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Generate an extraction id. Engine GIDs are bare 16-digit hex, so the
/// `ext-` prefix keeps the namespaces apart.
fn new_extraction_id() -> String {
    use rand::Rng;

    let bytes: [u8; 8] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("ext-{}", hex)
}
