// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Browsing, deleting and extracting files under the download root.
//!
//! Every operation resolves its paths through [`DownloadRoot::resolve`]
//! before touching the filesystem.

pub mod archive;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{HarvestError, HarvestResult};
use crate::paths::DownloadRoot;
use crate::registry::Registry;
use crate::types::{ExtractionStatus, ExtractionTask};

/// One directory entry.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the download root
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    /// Lowercased final extension including the dot, or empty
    pub extension: String,
    pub can_extract: bool,
}

/// Contents of one directory.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryListing {
    /// Listed directory relative to the root ("" for the root)
    pub path: String,
    /// Parent directory, absent at the root
    pub parent: Option<String>,
    pub entries: Vec<FileEntry>,
    pub count: usize,
}

/// Regular files directly under the root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RootSummary {
    pub files: u64,
    pub total_bytes: u64,
}

/// File operations confined to the download root.
pub struct FileManager {
    root: DownloadRoot,
    registry: Arc<Registry>,
}

fn map_missing(err: std::io::Error, input: &str) -> HarvestError {
    if err.kind() == std::io::ErrorKind::NotFound {
        HarvestError::path_not_found(input)
    } else {
        HarvestError::Io(err)
    }
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}

impl FileManager {
    pub fn new(root: DownloadRoot, registry: Arc<Registry>) -> Self {
        Self { root, registry }
    }

    pub fn root(&self) -> &DownloadRoot {
        &self.root
    }

    /// List a directory, directories first, then by case-insensitive name.
    pub async fn list_directory(&self, path: &str) -> HarvestResult<DirectoryListing> {
        let absolute = self.root.resolve(path)?;
        let meta = tokio::fs::metadata(&absolute).await.map_err(|e| map_missing(e, path))?;
        if !meta.is_dir() {
            return Err(HarvestError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&absolute).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            // Follows symlinks; dangling links are listed as empty files
            let meta = tokio::fs::metadata(item.path()).await.ok();
            let is_directory = meta.as_ref().map_or(false, |m| m.is_dir());
            let extension = if is_directory { String::new() } else { extension_of(&name) };
            entries.push(FileEntry {
                path: self.root.relative(&item.path()),
                is_directory,
                size: meta.as_ref().filter(|m| m.is_file()).map_or(0, |m| m.len()),
                modified_at: meta
                    .as_ref()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
                can_extract: !is_directory && archive::is_archive(&name),
                extension,
                name,
            });
        }

        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        let relative = self.root.relative(&absolute);
        let parent = if self.root.is_root(&absolute) {
            None
        } else {
            Some(absolute.parent().map(|p| self.root.relative(p)).unwrap_or_default())
        };

        Ok(DirectoryListing {
            path: relative,
            parent,
            count: entries.len(),
            entries,
        })
    }

    /// Delete a file, or a directory recursively. The root itself is refused.
    pub async fn delete_entry(&self, path: &str) -> HarvestResult<()> {
        let absolute = self.root.resolve(path)?;
        if self.root.is_root(&absolute) {
            return Err(HarvestError::PathEscape("refusing to delete the download root".into()));
        }

        let meta = tokio::fs::symlink_metadata(&absolute)
            .await
            .map_err(|e| map_missing(e, path))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&absolute).await?;
        } else {
            // Files and symlinks (the link, never its target)
            tokio::fs::remove_file(&absolute).await?;
        }

        tracing::info!(target: "harvester::files", path = %self.root.relative(&absolute), "Deleted");
        Ok(())
    }

    /// Containment-checked absolute path of a regular file.
    pub async fn resolve_file(&self, path: &str) -> HarvestResult<PathBuf> {
        let absolute = self.root.resolve(path)?;
        let meta = tokio::fs::metadata(&absolute).await.map_err(|e| map_missing(e, path))?;
        if !meta.is_file() {
            return Err(HarvestError::InvalidRequest(format!("{} is not a regular file", path)));
        }
        Ok(absolute)
    }

    /// Count and total size of the regular files directly under the root.
    pub async fn root_summary(&self) -> HarvestResult<RootSummary> {
        let mut summary = RootSummary::default();
        let mut dir = tokio::fs::read_dir(self.root.path()).await?;
        while let Some(item) = dir.next_entry().await? {
            if let Ok(meta) = item.metadata().await {
                if meta.is_file() {
                    summary.files += 1;
                    summary.total_bytes += meta.len();
                }
            }
        }
        Ok(summary)
    }

    /// Start extracting an archive in the background.
    ///
    /// The target defaults to the archive path without its archive
    /// extension. Returns the pending task; poll it through the registry.
    pub async fn extract_archive(&self, archive_path: &str, target: Option<&str>) -> HarvestResult<ExtractionTask> {
        let archive_abs = self.root.resolve(archive_path)?;
        let meta = tokio::fs::metadata(&archive_abs)
            .await
            .map_err(|e| map_missing(e, archive_path))?;
        if !meta.is_file() {
            return Err(HarvestError::InvalidRequest(format!("{} is not a file", archive_path)));
        }

        let file_name = archive_abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let format = archive::detect_format(&file_name)?;

        let target_abs = match target.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => self.root.resolve(t)?,
            None => archive_abs.with_file_name(archive::strip_archive_extension(&file_name)),
        };
        if target_abs.exists() && !target_abs.is_dir() {
            return Err(HarvestError::NotADirectory(self.root.relative(&target_abs)));
        }

        let task = ExtractionTask::new(
            self.root.relative(&archive_abs),
            self.root.relative(&target_abs),
            format,
        );
        self.registry.insert_extraction(task.clone())?;
        tracing::info!(
            target: "harvester::files",
            id = %task.id,
            archive = %task.archive_path,
            target_dir = %task.target_dir,
            "Extraction queued"
        );

        let registry = Arc::clone(&self.registry);
        let id = task.id.clone();
        tokio::spawn(async move {
            let worker_registry = Arc::clone(&registry);
            let worker_id = id.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let _ = worker_registry.update_extraction(&worker_id, |t| t.status = ExtractionStatus::Running);
                archive::unpack(format, &archive_abs, &target_abs)
            })
            .await;

            let result = match outcome {
                Ok(Ok(count)) => Ok(count),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(join_err) => Err(format!("extraction worker failed: {}", join_err)),
            };

            let finished = registry.update_extraction(&id, |t| {
                t.finished_at = Some(Utc::now());
                match &result {
                    Ok(count) => {
                        t.status = ExtractionStatus::Succeeded;
                        t.entries_extracted = *count;
                    }
                    Err(message) => {
                        t.status = ExtractionStatus::Failed;
                        t.error = Some(message.clone());
                    }
                }
            });
            match (finished, result) {
                (Ok(task), Ok(count)) => tracing::info!(
                    target: "harvester::files",
                    id = %task.id,
                    entries = count,
                    "Extraction finished"
                ),
                (_, Err(message)) => tracing::error!(
                    target: "harvester::files",
                    id = %id,
                    "Extraction failed: {}",
                    message
                ),
                (Err(e), Ok(_)) => tracing::error!(target: "harvester::files", "Extraction record lost: {}", e),
            }
        });

        Ok(task)
    }

    pub fn get_extraction(&self, id: &str) -> HarvestResult<ExtractionTask> {
        self.registry
            .get_extraction(id)
            .ok_or_else(|| HarvestError::extraction_not_found(id))
    }

    pub fn list_extractions(&self, status: Option<ExtractionStatus>) -> Vec<ExtractionTask> {
        self.registry.list_extractions(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager() -> (TempDir, FileManager) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = DownloadRoot::new(dir.path()).unwrap();
        (dir, FileManager::new(root, Arc::new(Registry::new())))
    }

    fn write_zip(path: &Path) {
        let mut writer = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        writer
            .start_file("hello.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hi").unwrap();
        writer.finish().unwrap();
    }

    async fn wait_terminal(files: &FileManager, id: &str) -> ExtractionTask {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let task = files.get_extraction(id).unwrap();
                if task.status.is_terminal() {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("extraction should finish")
    }

    #[tokio::test]
    async fn test_listing_order_and_fields() {
        let (_dir, files) = manager();
        let root = files.root().path().to_path_buf();
        std::fs::create_dir(root.join("zeta")).unwrap();
        std::fs::create_dir(root.join("Alpha")).unwrap();
        std::fs::write(root.join("b.ISO"), b"12345").unwrap();
        std::fs::write(root.join("a.zip"), b"zip").unwrap();

        let listing = files.list_directory("").await.unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "zeta", "a.zip", "b.ISO"]);
        assert_eq!(listing.parent, None);
        assert_eq!(listing.count, 4);

        let iso = &listing.entries[3];
        assert_eq!(iso.size, 5);
        assert_eq!(iso.extension, ".iso");
        assert!(!iso.can_extract);
        assert!(iso.modified_at.is_some());
        assert!(listing.entries[2].can_extract);

        let nested = files.list_directory("zeta").await.unwrap();
        assert_eq!(nested.path, "zeta");
        assert_eq!(nested.parent.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_listing_errors() {
        let (_dir, files) = manager();
        std::fs::write(files.root().path().join("f.txt"), b"x").unwrap();

        assert!(matches!(files.list_directory("../").await, Err(HarvestError::PathEscape(_))));
        assert!(matches!(files.list_directory("missing").await, Err(HarvestError::NotFound { .. })));
        assert!(matches!(files.list_directory("f.txt").await, Err(HarvestError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, files) = manager();
        let root = files.root().path().to_path_buf();
        std::fs::create_dir_all(root.join("d/sub")).unwrap();
        std::fs::write(root.join("d/sub/x"), b"x").unwrap();
        std::fs::write(root.join("f"), b"x").unwrap();

        files.delete_entry("d").await.unwrap();
        files.delete_entry("f").await.unwrap();
        assert!(!root.join("d").exists());
        assert!(!root.join("f").exists());

        assert!(matches!(files.delete_entry("").await, Err(HarvestError::PathEscape(_))));
        assert!(matches!(files.delete_entry("..").await, Err(HarvestError::PathEscape(_))));
        assert!(matches!(files.delete_entry("f").await, Err(HarvestError::NotFound { .. })));
        assert!(root.exists());
    }

    #[tokio::test]
    async fn test_root_summary_counts_top_level_files() {
        let (_dir, files) = manager();
        let root = files.root().path().to_path_buf();
        std::fs::write(root.join("a"), b"abc").unwrap();
        std::fs::write(root.join("b"), b"de").unwrap();
        std::fs::create_dir(root.join("dir")).unwrap();
        std::fs::write(root.join("dir/c"), b"ignored").unwrap();

        let summary = files.root_summary().await.unwrap();
        assert_eq!(summary, RootSummary { files: 2, total_bytes: 5 });
    }

    #[tokio::test]
    async fn test_resolve_file() {
        let (_dir, files) = manager();
        std::fs::create_dir(files.root().path().join("d")).unwrap();
        std::fs::write(files.root().path().join("d/f.bin"), b"x").unwrap();
        assert!(files.resolve_file("d/f.bin").await.unwrap().ends_with("d/f.bin"));
        assert!(matches!(files.resolve_file("d").await, Err(HarvestError::InvalidRequest(_))));
        assert!(matches!(files.resolve_file("../x").await, Err(HarvestError::PathEscape(_))));
    }

    #[tokio::test]
    async fn test_extract_to_default_target() {
        let (_dir, files) = manager();
        let root = files.root().path().to_path_buf();
        std::fs::create_dir(root.join("in")).unwrap();
        write_zip(&root.join("in/pack.zip"));

        let task = files.extract_archive("in/pack.zip", None).await.unwrap();
        assert_eq!(task.status, ExtractionStatus::Pending);
        assert_eq!(task.target_dir, "in/pack");

        let done = wait_terminal(&files, &task.id).await;
        assert_eq!(done.status, ExtractionStatus::Succeeded);
        assert_eq!(done.entries_extracted, 1);
        assert!(done.finished_at.is_some());
        assert_eq!(std::fs::read_to_string(root.join("in/pack/hello.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_extract_failure_is_recorded() {
        let (_dir, files) = manager();
        std::fs::write(files.root().path().join("bad.zip"), b"garbage").unwrap();

        let task = files.extract_archive("bad.zip", Some("out")).await.unwrap();
        let done = wait_terminal(&files, &task.id).await;
        assert_eq!(done.status, ExtractionStatus::Failed);
        assert!(done.error.is_some());
    }

    #[tokio::test]
    async fn test_extract_validation() {
        let (_dir, files) = manager();
        let root = files.root().path().to_path_buf();
        std::fs::write(root.join("a.rar"), b"x").unwrap();
        std::fs::write(root.join("a.txt"), b"x").unwrap();
        write_zip(&root.join("ok.zip"));

        assert!(matches!(
            files.extract_archive("a.rar", None).await,
            Err(HarvestError::UnsupportedArchive(_))
        ));
        assert!(matches!(
            files.extract_archive("a.txt", None).await,
            Err(HarvestError::UnsupportedArchive(_))
        ));
        assert!(matches!(
            files.extract_archive("missing.zip", None).await,
            Err(HarvestError::NotFound { .. })
        ));
        assert!(matches!(
            files.extract_archive("ok.zip", Some("../out")).await,
            Err(HarvestError::PathEscape(_))
        ));
        assert!(files.list_extractions(None).is_empty());
    }
}
