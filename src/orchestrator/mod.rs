// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle operations.
//!
//! The orchestrator validates requests, drives the engine and records the
//! outcome in the registry. Local state is authoritative: pause and resume
//! are advisory to the engine, and a transient engine failure does not stop
//! the local transition.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{HarvestError, HarvestResult};
use crate::paths::DownloadRoot;
use crate::registry::Registry;
use crate::rpc::{EngineOptions, EngineRpc, EngineVersion, GlobalStat};
use crate::types::{DownloadFilter, DownloadStatus, DownloadTask};

/// URI prefixes the engine is allowed to fetch.
const ACCEPTED_SCHEMES: &[&str] = &["http://", "https://", "ftp://", "sftp://", "magnet:"];

/// Default cap on non-fresh retries per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Engine version and counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub version: EngineVersion,
    pub global: GlobalStat,
}

/// Coordinates the engine, the registry and the download root.
pub struct Orchestrator {
    engine: Arc<dyn EngineRpc>,
    registry: Arc<Registry>,
    root: DownloadRoot,
    max_retries: u32,
    /// Options applied to every submission unless the request overrides them
    default_options: EngineOptions,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn EngineRpc>, registry: Arc<Registry>, root: DownloadRoot) -> Self {
        Self {
            engine,
            registry,
            root,
            max_retries: DEFAULT_MAX_RETRIES,
            default_options: EngineOptions::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_default_options(mut self, options: EngineOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn root(&self) -> &DownloadRoot {
        &self.root
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn merged_options(&self, options: &EngineOptions) -> EngineOptions {
        let mut merged = self.default_options.clone();
        merged.extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Resolve and create a destination directory under the root.
    async fn prepare_destination(&self, destination: &str) -> HarvestResult<(std::path::PathBuf, String)> {
        let absolute = self.root.resolve(destination).map_err(|e| match e {
            HarvestError::PathEscape(p) => {
                HarvestError::InvalidPath(format!("destination must stay inside the download root: {}", p))
            }
            other => other,
        })?;
        if absolute.exists() && !absolute.is_dir() {
            return Err(HarvestError::NotADirectory(destination.to_string()));
        }
        tokio::fs::create_dir_all(&absolute).await?;
        let relative = self.root.relative(&absolute);
        Ok((absolute, relative))
    }

    /// Submit a new download and start tracking it.
    ///
    /// All `uris` are mirrors of the same content. `destination` is relative
    /// to the download root; an empty string means the root itself.
    pub async fn add_download(
        &self,
        uris: Vec<String>,
        destination: &str,
        options: EngineOptions,
    ) -> HarvestResult<DownloadTask> {
        let uris: Vec<String> = uris
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if uris.is_empty() {
            return Err(HarvestError::InvalidRequest("at least one URI is required".into()));
        }
        if let Some(bad) = uris.iter().find(|u| !has_accepted_scheme(u)) {
            return Err(HarvestError::InvalidRequest(format!(
                "unsupported URI scheme: {} (expected http, https, ftp, sftp or magnet)",
                bad
            )));
        }
        if options.contains_key("dir") {
            return Err(HarvestError::InvalidRequest(
                "set the destination field instead of the dir option".into(),
            ));
        }

        let (absolute, relative) = self.prepare_destination(destination).await?;
        let gid = self
            .engine
            .add_uri(&uris, &absolute, &self.merged_options(&options))
            .await?;

        let task = DownloadTask::new(gid, uris, relative).with_options(options);
        if let Err(e) = self.registry.insert(task.clone()) {
            if let Err(cleanup) = self.engine.remove(&task.engine_gid).await {
                tracing::warn!(
                    target: "harvester::orchestrator",
                    gid = %task.engine_gid,
                    "Failed to cancel untracked transfer: {}",
                    cleanup
                );
            }
            return Err(e);
        }

        tracing::info!(
            target: "harvester::orchestrator",
            id = %task.id,
            uris = task.source_uris.len(),
            dir = %task.destination_dir,
            "Download added"
        );
        Ok(task)
    }

    pub fn get_download(&self, id: &str) -> HarvestResult<DownloadTask> {
        self.registry.get(id).ok_or_else(|| HarvestError::download_not_found(id))
    }

    pub fn list_downloads(&self, filter: &DownloadFilter) -> Vec<DownloadTask> {
        self.registry.list(filter)
    }

    /// Pause an active download. Already-paused downloads are left as is.
    pub async fn pause_download(&self, id: &str) -> HarvestResult<DownloadTask> {
        let task = self.get_download(id)?;
        match task.status {
            DownloadStatus::Paused => return Ok(task),
            DownloadStatus::Active => {}
            from => return Err(invalid(id, from, "pause")),
        }

        best_effort("pause", id, self.engine.pause(&task.engine_gid).await)?;

        let (task, _) = self.registry.update(id, |t| match t.status {
            DownloadStatus::Paused => Ok(()),
            from if from.can_transition_to(DownloadStatus::Paused) => {
                t.download_speed = 0;
                t.update_status(DownloadStatus::Paused);
                Ok(())
            }
            from => Err(invalid(id, from, "pause")),
        })?;
        tracing::info!(target: "harvester::orchestrator", id, "Download paused");
        Ok(task)
    }

    /// Resume a paused download. Queued and active downloads are left as is.
    pub async fn resume_download(&self, id: &str) -> HarvestResult<DownloadTask> {
        let task = self.get_download(id)?;
        match task.status {
            DownloadStatus::Active | DownloadStatus::Queued => return Ok(task),
            DownloadStatus::Paused => {}
            from => return Err(invalid(id, from, "resume")),
        }

        best_effort("resume", id, self.engine.resume(&task.engine_gid).await)?;

        let (task, _) = self.registry.update(id, |t| match t.status {
            DownloadStatus::Active | DownloadStatus::Queued => Ok(()),
            DownloadStatus::Paused => {
                t.update_status(DownloadStatus::Active);
                Ok(())
            }
            from => Err(invalid(id, from, "resume")),
        })?;
        tracing::info!(target: "harvester::orchestrator", id, "Download resumed");
        Ok(task)
    }

    /// Stop tracking a download, cancelling it on the engine if still running.
    pub async fn remove_download(&self, id: &str) -> HarvestResult<DownloadTask> {
        let task = self.get_download(id)?;

        let engine_result = if task.status.is_terminal() {
            self.engine.remove_result(&task.engine_gid).await
        } else {
            self.engine.remove(&task.engine_gid).await
        };
        if let Err(e) = engine_result {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::debug!(
                target: "harvester::orchestrator",
                id,
                gid = %task.engine_gid,
                "Engine-side removal ignored: {}",
                e
            );
        }

        // Concurrent removal makes the second caller see NotFound here.
        let _ = self.registry.update(id, |t| {
            if t.status.can_transition_to(DownloadStatus::Removed) {
                t.download_speed = 0;
                t.update_status(DownloadStatus::Removed);
            }
            Ok(())
        })?;
        let removed = self.registry.remove(id)?;
        tracing::info!(target: "harvester::orchestrator", id, "Download removed");
        Ok(removed)
    }

    /// Re-submit a failed download.
    ///
    /// Without `fresh`, each retry counts against the retry ceiling. A fresh
    /// retry resets the counter.
    pub async fn retry_download(&self, id: &str, fresh: bool) -> HarvestResult<DownloadTask> {
        let task = self.get_download(id)?;
        check_retry(&task, fresh, self.max_retries)?;

        let (absolute, _) = self.prepare_destination(&task.destination_dir).await?;
        let new_gid = self
            .engine
            .add_uri(&task.source_uris, &absolute, &self.merged_options(&task.options))
            .await?;

        let max_retries = self.max_retries;
        let committed = self.registry.update(id, |t| {
            check_retry(t, fresh, max_retries)?;
            t.retry_count = if fresh { 0 } else { t.retry_count + 1 };
            t.engine_gid = new_gid.clone();
            t.last_error = None;
            t.progress_bytes = 0;
            t.download_speed = 0;
            t.update_status(DownloadStatus::Queued);
            Ok(())
        });

        let (retried, _) = match committed {
            Ok(done) => done,
            Err(e) => {
                // Lost a race with another retry or a removal
                let _ = self.engine.remove(&new_gid).await;
                return Err(e);
            }
        };

        if let Err(e) = self.engine.remove_result(&task.engine_gid).await {
            tracing::debug!(
                target: "harvester::orchestrator",
                id,
                gid = %task.engine_gid,
                "Could not purge previous engine result: {}",
                e
            );
        }

        tracing::info!(
            target: "harvester::orchestrator",
            id,
            gid = %new_gid,
            retry_count = retried.retry_count,
            fresh,
            "Download retried"
        );
        Ok(retried)
    }

    /// Engine version and global counters.
    pub async fn engine_status(&self) -> HarvestResult<EngineInfo> {
        let version = self.engine.get_version().await?;
        let global = self.engine.get_global_stat().await?;
        Ok(EngineInfo { version, global })
    }
}

fn invalid(id: &str, from: DownloadStatus, action: &'static str) -> HarvestError {
    HarvestError::InvalidTransition {
        id: id.to_string(),
        from,
        action,
    }
}

fn check_retry(task: &DownloadTask, fresh: bool, max_retries: u32) -> HarvestResult<()> {
    if task.status != DownloadStatus::Failed {
        return Err(invalid(&task.id, task.status, "retry"));
    }
    if !fresh && task.retry_count >= max_retries {
        return Err(HarvestError::RetryExhausted {
            id: task.id.clone(),
            max: max_retries,
        });
    }
    Ok(())
}

/// Swallow engine failures that should not block a local transition.
fn best_effort(action: &str, id: &str, result: HarvestResult<()>) -> HarvestResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e @ (HarvestError::TransientRpcFailure(_) | HarvestError::EngineRejected { .. })) => {
            tracing::warn!(
                target: "harvester::orchestrator",
                id,
                action,
                "Engine did not confirm, applying locally: {}",
                e
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Check a URI against the accepted scheme list (case-insensitive).
pub fn has_accepted_scheme(uri: &str) -> bool {
    let lower = uri.to_ascii_lowercase();
    ACCEPTED_SCHEMES.iter().any(|scheme| {
        lower.starts_with(scheme) && lower.len() > scheme.len()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{EngineState, InjectedFailure, MemoryEngine};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        engine: Arc<MemoryEngine>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = DownloadRoot::new(dir.path()).unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let orchestrator = Orchestrator::new(engine.clone(), Arc::new(Registry::new()), root)
            .with_max_retries(2);
        Fixture { _dir: dir, engine, orchestrator }
    }

    fn uris(u: &str) -> Vec<String> {
        vec![u.to_string()]
    }

    async fn add(fx: &Fixture) -> DownloadTask {
        fx.orchestrator
            .add_download(uris("https://example.com/a.iso"), "isos", EngineOptions::new())
            .await
            .unwrap()
    }

    fn set_status(fx: &Fixture, id: &str, status: DownloadStatus) {
        fx.orchestrator
            .registry()
            .update(id, |t| {
                t.status = status;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_accepted_schemes() {
        assert!(has_accepted_scheme("http://example.com/a"));
        assert!(has_accepted_scheme("HTTPS://example.com/a"));
        assert!(has_accepted_scheme("ftp://mirror/a"));
        assert!(has_accepted_scheme("sftp://host/a"));
        assert!(has_accepted_scheme("magnet:?xt=urn:btih:abc"));
        assert!(!has_accepted_scheme("file:///etc/passwd"));
        assert!(!has_accepted_scheme("https://"));
        assert!(!has_accepted_scheme("example.com/a"));
    }

    #[tokio::test]
    async fn test_add_creates_destination_and_registers() {
        let fx = fixture();
        let task = add(&fx).await;

        assert_eq!(task.status, DownloadStatus::Queued);
        assert_eq!(task.destination_dir, "isos");
        assert!(fx.orchestrator.root().path().join("isos").is_dir());

        let transfer = fx.engine.transfer(&task.engine_gid).unwrap();
        assert_eq!(transfer.dir, fx.orchestrator.root().path().join("isos"));
        assert_eq!(fx.orchestrator.get_download(&task.id).unwrap().id, task.id);
    }

    #[tokio::test]
    async fn test_add_cancels_transfer_when_registration_fails() {
        let fx = fixture();
        let taken = format!("{:016x}", 1);
        fx.orchestrator
            .registry()
            .insert(DownloadTask::new(taken.clone(), uris("https://example.com/old"), String::new()))
            .unwrap();

        let err = fx
            .orchestrator
            .add_download(uris("https://example.com/a.iso"), "", EngineOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::DuplicateId(_)));
        assert!(fx.engine.calls().iter().any(|c| c == "aria2.forceRemove"));
        assert_eq!(fx.engine.transfer(&taken).unwrap().state, EngineState::Removed);
        assert_eq!(fx.orchestrator.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_default_options_are_merged() {
        let mut defaults = EngineOptions::new();
        defaults.insert("max-connection-per-server".into(), serde_json::json!("4"));
        defaults.insert("split".into(), serde_json::json!("4"));
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            fx.engine.clone(),
            Arc::new(Registry::new()),
            fx.orchestrator.root().clone(),
        )
        .with_default_options(defaults);

        let mut options = EngineOptions::new();
        options.insert("split".into(), serde_json::json!("8"));
        let task = orchestrator
            .add_download(uris("http://example.com/b"), "", options)
            .await
            .unwrap();

        let sent = fx.engine.transfer(&task.engine_gid).unwrap().options;
        assert_eq!(sent["max-connection-per-server"], "4");
        assert_eq!(sent["split"], "8");
        assert!(!task.options.contains_key("max-connection-per-server"));
    }

    #[tokio::test]
    async fn test_add_validation() {
        let fx = fixture();
        let o = &fx.orchestrator;

        let err = o.add_download(vec![], "", EngineOptions::new()).await.unwrap_err();
        assert!(matches!(err, HarvestError::InvalidRequest(_)));

        let err = o
            .add_download(vec!["  ".into()], "", EngineOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidRequest(_)));

        let err = o
            .add_download(uris("file:///etc/passwd"), "", EngineOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidRequest(_)));

        let err = o
            .add_download(uris("http://example.com/a"), "../outside", EngineOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidPath(_)));

        let mut options = EngineOptions::new();
        options.insert("dir".into(), serde_json::json!("/tmp"));
        let err = o
            .add_download(uris("http://example.com/a"), "", options)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidRequest(_)));

        assert!(fx.engine.calls().is_empty());
        assert!(o.registry().is_empty());
    }

    #[tokio::test]
    async fn test_add_engine_failure_registers_nothing() {
        let fx = fixture();
        fx.engine.inject_failure(Some(InjectedFailure::Transient));
        let err = fx
            .orchestrator
            .add_download(uris("http://example.com/a"), "", EngineOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(fx.orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let fx = fixture();
        let task = add(&fx).await;

        // Queued cannot be paused, and resume of queued is a no-op
        let err = fx.orchestrator.pause_download(&task.id).await.unwrap_err();
        assert!(matches!(err, HarvestError::InvalidTransition { from: DownloadStatus::Queued, .. }));
        assert_eq!(
            fx.orchestrator.resume_download(&task.id).await.unwrap().status,
            DownloadStatus::Queued
        );

        set_status(&fx, &task.id, DownloadStatus::Active);
        fx.engine.set_state(&task.engine_gid, EngineState::Active);

        let paused = fx.orchestrator.pause_download(&task.id).await.unwrap();
        assert_eq!(paused.status, DownloadStatus::Paused);
        assert_eq!(fx.engine.transfer(&task.engine_gid).unwrap().state, EngineState::Paused);

        // Idempotent
        let again = fx.orchestrator.pause_download(&task.id).await.unwrap();
        assert_eq!(again.status, DownloadStatus::Paused);

        let resumed = fx.orchestrator.resume_download(&task.id).await.unwrap();
        assert_eq!(resumed.status, DownloadStatus::Active);
    }

    #[tokio::test]
    async fn test_pause_applies_locally_on_transient_engine_failure() {
        let fx = fixture();
        let task = add(&fx).await;
        set_status(&fx, &task.id, DownloadStatus::Active);

        fx.engine.inject_failure(Some(InjectedFailure::Transient));
        let paused = fx.orchestrator.pause_download(&task.id).await.unwrap();
        assert_eq!(paused.status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn test_pause_auth_failure_leaves_state() {
        let fx = fixture();
        let task = add(&fx).await;
        set_status(&fx, &task.id, DownloadStatus::Active);

        fx.engine.inject_failure(Some(InjectedFailure::Auth));
        let err = fx.orchestrator.pause_download(&task.id).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            fx.orchestrator.get_download(&task.id).unwrap().status,
            DownloadStatus::Active
        );
    }

    #[tokio::test]
    async fn test_terminal_tasks_reject_pause_and_resume() {
        let fx = fixture();
        let task = add(&fx).await;
        set_status(&fx, &task.id, DownloadStatus::Completed);

        assert!(matches!(
            fx.orchestrator.pause_download(&task.id).await,
            Err(HarvestError::InvalidTransition { .. })
        ));
        assert!(matches!(
            fx.orchestrator.resume_download(&task.id).await,
            Err(HarvestError::InvalidTransition { .. })
        ));
        assert!(matches!(
            fx.orchestrator.pause_download("nope").await,
            Err(HarvestError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_running_download() {
        let fx = fixture();
        let task = add(&fx).await;

        let removed = fx.orchestrator.remove_download(&task.id).await.unwrap();
        assert_eq!(removed.status, DownloadStatus::Removed);
        assert!(fx.orchestrator.get_download(&task.id).is_err());
        assert_eq!(fx.engine.transfer(&task.engine_gid).unwrap().state, EngineState::Removed);
        assert!(matches!(
            fx.orchestrator.remove_download(&task.id).await,
            Err(HarvestError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_finished_download_purges_engine_result() {
        let fx = fixture();
        let task = add(&fx).await;
        fx.engine.set_state(&task.engine_gid, EngineState::Complete);
        set_status(&fx, &task.id, DownloadStatus::Completed);

        let removed = fx.orchestrator.remove_download(&task.id).await.unwrap();
        assert_eq!(removed.status, DownloadStatus::Completed);
        assert!(fx.engine.transfer(&task.engine_gid).is_none());
    }

    #[tokio::test]
    async fn test_remove_ignores_engine_errors_except_auth() {
        let fx = fixture();
        let a = add(&fx).await;
        let b = add(&fx).await;

        fx.engine.forget(&a.engine_gid);
        fx.orchestrator.remove_download(&a.id).await.unwrap();

        fx.engine.inject_failure(Some(InjectedFailure::Auth));
        assert!(fx.orchestrator.remove_download(&b.id).await.unwrap_err().is_fatal());
        assert!(fx.orchestrator.get_download(&b.id).is_ok());
    }

    #[tokio::test]
    async fn test_retry_flow_and_ceiling() {
        let fx = fixture();
        let task = add(&fx).await;

        let err = fx.orchestrator.retry_download(&task.id, false).await.unwrap_err();
        assert!(matches!(err, HarvestError::InvalidTransition { action: "retry", .. }));

        let mut gid = task.engine_gid.clone();
        for expected in 1..=2 {
            fx.engine.fail_transfer(&gid, "1", "network problem");
            fx.orchestrator
                .registry()
                .update(&task.id, |t| {
                    t.fail("network problem");
                    Ok(())
                })
                .unwrap();

            let retried = fx.orchestrator.retry_download(&task.id, false).await.unwrap();
            assert_eq!(retried.id, task.id);
            assert_eq!(retried.status, DownloadStatus::Queued);
            assert_eq!(retried.retry_count, expected);
            assert!(retried.last_error.is_none());
            assert_ne!(retried.engine_gid, gid);
            // Previous attempt purged from the engine
            assert!(fx.engine.transfer(&gid).is_none());
            gid = retried.engine_gid;
        }

        set_status(&fx, &task.id, DownloadStatus::Failed);
        let err = fx.orchestrator.retry_download(&task.id, false).await.unwrap_err();
        assert!(matches!(err, HarvestError::RetryExhausted { max: 2, .. }));
        assert_eq!(
            fx.orchestrator.get_download(&task.id).unwrap().status,
            DownloadStatus::Failed
        );

        let fresh = fx.orchestrator.retry_download(&task.id, true).await.unwrap();
        assert_eq!(fresh.retry_count, 0);
        assert_eq!(fresh.status, DownloadStatus::Queued);
        let transfer = fx.engine.transfer(&fresh.engine_gid).unwrap();
        assert_eq!(transfer.uris, task.source_uris);
        assert_eq!(transfer.dir, fx.orchestrator.root().path().join("isos"));
    }

    #[tokio::test]
    async fn test_engine_status() {
        let fx = fixture();
        add(&fx).await;
        let info = fx.orchestrator.engine_status().await.unwrap();
        assert_eq!(info.version.version, "1.37.0");
        assert_eq!(info.global.num_waiting, 1);
    }
}
