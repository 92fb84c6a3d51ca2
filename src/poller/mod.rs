// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background reconciliation of engine state into the registry.
//!
//! Every tick the poller fetches the engine's active, waiting and stopped
//! lists and merges them into the registry. A cycle either applies a complete
//! engine view or nothing: a fetch failure aborts it before any update.
//!
//! Local mutations win over the engine for one cycle: a task whose
//! `updated_at` is later than the cycle start was changed by a request
//! handler while the fetch was in flight and is left for the next tick.

mod health;

pub use health::{EngineHealth, HealthMonitor, HealthSnapshot};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::HarvestResult;
use crate::registry::Registry;
use crate::rpc::{EngineRpc, EngineState, EngineStatusSnapshot};
use crate::types::{DownloadFilter, DownloadStatus, DownloadTask};

/// Default polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Error recorded for tasks the engine no longer reports.
pub const LOST_CONTACT: &str = "lost contact with engine";

/// Error recorded for tasks the engine removed on its own.
pub const REMOVED_BY_ENGINE: &str = "removed by engine";

/// Outcome of a single reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Tasks whose record changed
    pub updated: usize,
    /// Tasks skipped because they were mutated during the fetch
    pub skipped: usize,
    /// Tasks failed because the engine no longer knows them
    pub lost: usize,
    /// Finished tasks dropped by retention
    pub purged: usize,
    /// Locally paused tasks the engine was asked to pause again
    pub repaused: usize,
}

/// Reconciles the registry with the engine on a fixed interval.
pub struct Poller {
    engine: Arc<dyn EngineRpc>,
    registry: Arc<Registry>,
    health: Arc<HealthMonitor>,
    interval: Duration,
    retention: Option<Duration>,
}

/// Handle to a running poller task.
pub struct PollerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// True once the poll loop has exited (shutdown or auth failure).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(target: "harvester::poller", "Poller task failed: {}", e);
        }
    }
}

impl Poller {
    pub fn new(engine: Arc<dyn EngineRpc>, registry: Arc<Registry>, health: Arc<HealthMonitor>) -> Self {
        Self {
            engine,
            registry,
            health,
            interval: DEFAULT_POLL_INTERVAL,
            retention: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Purge completed/failed tasks older than `retention` after each cycle.
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Start the poll loop on the tokio runtime.
    pub fn spawn(self) -> PollerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                target: "harvester::poller",
                interval_ms = self.interval.as_millis() as u64,
                "Poller started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.reconcile_once().await {
                            Ok(report) => {
                                if report != ReconcileReport::default() {
                                    tracing::debug!(target: "harvester::poller", ?report, "Reconciled");
                                }
                            }
                            Err(e) if e.is_fatal() => {
                                tracing::error!(
                                    target: "harvester::poller",
                                    event = "ENGINE_AUTH_FAILED",
                                    "Engine rejected credentials, polling stopped: {}",
                                    e
                                );
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(target: "harvester::poller", "Poll cycle skipped: {}", e);
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(target: "harvester::poller", "Poller stopped");
        });

        PollerHandle { shutdown_tx, join }
    }

    /// Run one reconciliation cycle.
    ///
    /// Fetch errors abort the cycle without touching the registry and are
    /// recorded on the health monitor before being returned.
    pub async fn reconcile_once(&self) -> HarvestResult<ReconcileReport> {
        let cycle_start = Utc::now();

        let snapshots = match self.fetch_all().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                self.health.record_failure(&e);
                return Err(e);
            }
        };
        self.health.record_success();

        let mut report = ReconcileReport::default();
        let mut to_repause = Vec::new();
        for task in self.registry.list(&DownloadFilter::all()) {
            if task.status.is_terminal() {
                continue;
            }
            let outcome = match snapshots.get(&task.engine_gid) {
                Some(snapshot) => {
                    let (outcome, repause) = self.merge(&task.id, snapshot, cycle_start);
                    to_repause.extend(repause);
                    outcome
                }
                None => self.mark_lost(&task.id, cycle_start),
            };
            match outcome {
                Merge::Updated => report.updated += 1,
                Merge::Lost => report.lost += 1,
                Merge::Skipped => report.skipped += 1,
                Merge::Unchanged => {}
            }
        }
        report.repaused = self.repause(to_repause).await;

        if let Some(retention) = self.retention {
            if let Ok(window) = chrono::Duration::from_std(retention) {
                let purged = self.registry.purge_finished(Utc::now() - window);
                if !purged.is_empty() {
                    tracing::info!(target: "harvester::poller", count = purged.len(), "Purged finished downloads");
                }
                report.purged = purged.len();
            }
        }

        Ok(report)
    }

    async fn fetch_all(&self) -> HarvestResult<HashMap<String, EngineStatusSnapshot>> {
        let active = self.engine.tell_active().await?;
        let waiting = self.engine.tell_waiting().await?;
        let stopped = self.engine.tell_stopped().await?;

        Ok(stopped
            .into_iter()
            .chain(waiting)
            .chain(active)
            .map(|s| (s.gid.clone(), s))
            .collect())
    }

    /// Merge one snapshot. Returns the GID to pause again when the engine
    /// is still running a task that was paused locally.
    fn merge(
        &self,
        id: &str,
        snapshot: &EngineStatusSnapshot,
        cycle_start: DateTime<Utc>,
    ) -> (Merge, Option<String>) {
        let result = self.registry.update(id, |task| {
            if task.status.is_terminal() || task.engine_gid != snapshot.gid {
                return Ok(Applied::default());
            }
            if task.updated_at > cycle_start {
                return Ok(Applied {
                    outcome: Merge::Skipped,
                    repause: false,
                });
            }
            Ok(apply_snapshot(task, snapshot))
        });

        match result {
            Ok((task, applied)) => {
                if applied.outcome == Merge::Updated && task.status.is_terminal() {
                    tracing::info!(
                        target: "harvester::poller",
                        id = %task.id,
                        status = %task.status,
                        "Download finished"
                    );
                }
                (applied.outcome, applied.repause.then_some(task.engine_gid))
            }
            // Removed by a request handler since the listing
            Err(_) => (Merge::Unchanged, None),
        }
    }

    /// Ask the engine again to pause transfers the registry holds as paused.
    async fn repause(&self, gids: Vec<String>) -> usize {
        let mut sent = 0;
        for gid in gids {
            match self.engine.pause(&gid).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(
                    target: "harvester::poller",
                    gid = %gid,
                    "Engine still running a paused download: {}",
                    e
                ),
            }
        }
        sent
    }

    fn mark_lost(&self, id: &str, cycle_start: DateTime<Utc>) -> Merge {
        let result = self.registry.update(id, |task| {
            if task.status.is_terminal() {
                return Ok(Merge::Unchanged);
            }
            if task.updated_at >= cycle_start {
                return Ok(Merge::Skipped);
            }
            task.fail(LOST_CONTACT);
            Ok(Merge::Lost)
        });

        match result {
            Ok((task, Merge::Lost)) => {
                tracing::warn!(
                    target: "harvester::poller",
                    id = %task.id,
                    gid = %task.engine_gid,
                    "Engine no longer reports download"
                );
                Merge::Lost
            }
            Ok((_, outcome)) => outcome,
            Err(_) => Merge::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Merge {
    Updated,
    #[default]
    Unchanged,
    Skipped,
    Lost,
}

/// Result of merging one snapshot into a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Applied {
    outcome: Merge,
    /// Paused locally while the engine reports it running
    repause: bool,
}

/// Local status an engine state maps to.
fn reported_status(snapshot: &EngineStatusSnapshot) -> DownloadStatus {
    match snapshot.state {
        EngineState::Active => DownloadStatus::Active,
        EngineState::Waiting => DownloadStatus::Queued,
        EngineState::Paused => DownloadStatus::Paused,
        // Metadata transfer done; the payload continues under a new GID
        EngineState::Complete if !snapshot.followed_by.is_empty() => DownloadStatus::Active,
        EngineState::Complete => DownloadStatus::Completed,
        EngineState::Error | EngineState::Removed => DownloadStatus::Failed,
    }
}

fn failure_message(snapshot: &EngineStatusSnapshot) -> String {
    if snapshot.state == EngineState::Removed {
        return REMOVED_BY_ENGINE.to_string();
    }
    let message = snapshot
        .error_message
        .clone()
        .unwrap_or_else(|| "download failed".to_string());
    match &snapshot.error_code {
        Some(code) => format!("{} (code {})", message, code),
        None => message,
    }
}

/// Merge an engine snapshot into a task.
///
/// Progress is always taken from the engine. The status only moves along
/// state-machine edges, with `queued -> completed` treated as passing
/// through `active`. A local pause is kept even if the engine still runs
/// the transfer.
fn apply_snapshot(task: &mut DownloadTask, snapshot: &EngineStatusSnapshot) -> Applied {
    let before = (
        task.status,
        task.engine_gid.clone(),
        task.progress_bytes,
        task.total_bytes,
        task.download_speed,
        task.name.clone(),
        task.last_error.clone(),
    );

    if snapshot.total_length > 0 {
        task.total_bytes = Some(snapshot.total_length);
    }
    task.progress_bytes = snapshot.completed_length;
    task.download_speed = snapshot.download_speed;
    if snapshot.name.is_some() {
        task.name = snapshot.name.clone();
    }
    if snapshot.state == EngineState::Complete {
        if let Some(next_gid) = snapshot.followed_by.first() {
            task.engine_gid = next_gid.clone();
            task.progress_bytes = 0;
            task.total_bytes = None;
        }
    }

    let mut repause = false;
    match (task.status, reported_status(snapshot)) {
        (DownloadStatus::Paused, DownloadStatus::Active) => {
            task.download_speed = 0;
            repause = true;
        }
        (current, next) if current == next => {}
        (current, next)
            if current.can_transition_to(next)
                || (current, next) == (DownloadStatus::Queued, DownloadStatus::Completed) =>
        {
            match next {
                DownloadStatus::Completed => {
                    if let Some(total) = task.total_bytes {
                        task.progress_bytes = total;
                    }
                    task.download_speed = 0;
                }
                DownloadStatus::Failed => {
                    task.last_error = Some(failure_message(snapshot));
                    task.download_speed = 0;
                }
                _ => {}
            }
            task.status = next;
        }
        (current, next) => {
            tracing::debug!(
                target: "harvester::poller",
                id = %task.id,
                from = %current,
                to = %next,
                "Ignoring engine state outside the state machine"
            );
        }
    }

    let after = (
        task.status,
        task.engine_gid.clone(),
        task.progress_bytes,
        task.total_bytes,
        task.download_speed,
        task.name.clone(),
        task.last_error.clone(),
    );
    let outcome = if before != after {
        task.updated_at = Utc::now();
        Merge::Updated
    } else {
        Merge::Unchanged
    };
    Applied { outcome, repause }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{EngineOptions, InjectedFailure, MemoryEngine};
    use std::path::Path;

    struct Fixture {
        engine: Arc<MemoryEngine>,
        registry: Arc<Registry>,
        health: Arc<HealthMonitor>,
        poller: Poller,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MemoryEngine::new());
        let registry = Arc::new(Registry::new());
        let health = Arc::new(HealthMonitor::new());
        let poller = Poller::new(engine.clone(), Arc::clone(&registry), Arc::clone(&health));
        Fixture { engine, registry, health, poller }
    }

    /// Submit to the engine and register a task that predates the next cycle.
    async fn track(fx: &Fixture, uri: &str) -> String {
        let gid = fx
            .engine
            .add_uri(&[uri.to_string()], Path::new("/dl"), &EngineOptions::new())
            .await
            .unwrap();
        let mut task = DownloadTask::new(gid.clone(), vec![uri.to_string()], "");
        task.updated_at = Utc::now() - chrono::Duration::seconds(5);
        fx.registry.insert(task).unwrap();
        gid
    }

    /// Force a local status that predates the next cycle.
    fn set_local(fx: &Fixture, gid: &str, status: DownloadStatus) {
        fx.registry
            .update(gid, |t| {
                t.status = status;
                t.updated_at = Utc::now() - chrono::Duration::seconds(5);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_progress_is_merged() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/a.bin").await;
        fx.engine.set_state(&gid, EngineState::Active);
        fx.engine.set_progress(&gid, 250, 1000, 50);
        fx.engine.set_name(&gid, "a.bin");

        let report = fx.poller.reconcile_once().await.unwrap();
        assert_eq!(report.updated, 1);

        let task = fx.registry.get(&gid).unwrap();
        assert_eq!(task.status, DownloadStatus::Active);
        assert_eq!(task.progress_bytes, 250);
        assert_eq!(task.total_bytes, Some(1000));
        assert_eq!(task.download_speed, 50);
        assert_eq!(task.name.as_deref(), Some("a.bin"));
    }

    #[tokio::test]
    async fn test_engine_status_mapping() {
        let fx = fixture();
        let waiting = track(&fx, "http://example.com/w").await;
        let paused = track(&fx, "http://example.com/p").await;
        let complete = track(&fx, "http://example.com/c").await;
        let errored = track(&fx, "http://example.com/e").await;
        let removed = track(&fx, "http://example.com/r").await;

        set_local(&fx, &paused, DownloadStatus::Active);
        fx.engine.set_state(&paused, EngineState::Paused);
        fx.engine.set_progress(&complete, 10, 100, 5);
        fx.engine.set_state(&complete, EngineState::Complete);
        fx.engine.fail_transfer(&errored, "3", "Resource not found");
        fx.engine.set_state(&removed, EngineState::Removed);

        fx.poller.reconcile_once().await.unwrap();

        assert_eq!(fx.registry.get(&waiting).unwrap().status, DownloadStatus::Queued);
        assert_eq!(fx.registry.get(&paused).unwrap().status, DownloadStatus::Paused);

        let done = fx.registry.get(&complete).unwrap();
        assert_eq!(done.status, DownloadStatus::Completed);
        assert_eq!(done.progress_bytes, 100);
        assert_eq!(done.download_speed, 0);

        let failed = fx.registry.get(&errored).unwrap();
        assert_eq!(failed.status, DownloadStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("Resource not found (code 3)"));

        let gone = fx.registry.get(&removed).unwrap();
        assert_eq!(gone.status, DownloadStatus::Failed);
        assert_eq!(gone.last_error.as_deref(), Some(REMOVED_BY_ENGINE));
    }

    #[tokio::test]
    async fn test_local_pause_survives_unconfirmed_engine_pause() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/a").await;
        fx.engine.set_state(&gid, EngineState::Active);
        fx.engine.set_progress(&gid, 100, 1000, 40);
        // Pause applied locally while the engine call failed
        set_local(&fx, &gid, DownloadStatus::Paused);

        let report = fx.poller.reconcile_once().await.unwrap();
        assert_eq!(report.repaused, 1);
        let task = fx.registry.get(&gid).unwrap();
        assert_eq!(task.status, DownloadStatus::Paused);
        assert_eq!(task.progress_bytes, 100);
        assert_eq!(task.download_speed, 0);
        assert_eq!(fx.engine.transfer(&gid).unwrap().state, EngineState::Paused);

        // Engine resumed it on its own: the local pause still wins
        fx.engine.set_state(&gid, EngineState::Active);
        fx.poller.reconcile_once().await.unwrap();
        assert_eq!(fx.registry.get(&gid).unwrap().status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn test_engine_states_off_the_state_machine_are_ignored() {
        let fx = fixture();
        let active = track(&fx, "http://example.com/active").await;
        let paused = track(&fx, "http://example.com/paused").await;
        let queued = track(&fx, "http://example.com/queued").await;
        set_local(&fx, &active, DownloadStatus::Active);
        set_local(&fx, &paused, DownloadStatus::Paused);

        // active -> queued, paused -> queued and queued -> paused are not edges
        fx.engine.set_state(&active, EngineState::Waiting);
        fx.engine.set_state(&paused, EngineState::Waiting);
        fx.engine.set_state(&queued, EngineState::Paused);
        fx.poller.reconcile_once().await.unwrap();

        for (gid, expected) in [
            (&active, DownloadStatus::Active),
            (&paused, DownloadStatus::Paused),
            (&queued, DownloadStatus::Queued),
        ] {
            let status = fx.registry.get(gid).unwrap().status;
            assert_eq!(status, expected, "{}", gid);
        }
    }

    #[tokio::test]
    async fn test_queued_task_can_complete_between_polls() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/small").await;
        fx.engine.set_progress(&gid, 64, 64, 0);
        fx.engine.set_state(&gid, EngineState::Complete);

        fx.poller.reconcile_once().await.unwrap();
        let task = fx.registry.get(&gid).unwrap();
        assert_eq!(task.status, DownloadStatus::Completed);
        assert_eq!(task.progress_bytes, 64);
    }

    #[tokio::test]
    async fn test_missing_from_engine_becomes_lost() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/a").await;
        fx.engine.forget(&gid);

        let report = fx.poller.reconcile_once().await.unwrap();
        assert_eq!(report.lost, 1);
        let task = fx.registry.get(&gid).unwrap();
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some(LOST_CONTACT));
    }

    #[tokio::test]
    async fn test_fresh_local_mutation_is_not_overwritten() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/a").await;
        fx.engine.set_state(&gid, EngineState::Active);

        // Handler paused locally after the cycle began
        fx.registry
            .update(&gid, |t| {
                t.status = DownloadStatus::Paused;
                t.updated_at = Utc::now() + chrono::Duration::seconds(60);
                Ok(())
            })
            .unwrap();

        let report = fx.poller.reconcile_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(fx.registry.get(&gid).unwrap().status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_untouched() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/a").await;
        fx.registry
            .update(&gid, |t| {
                t.status = DownloadStatus::Completed;
                Ok(())
            })
            .unwrap();
        fx.engine.forget(&gid);

        let report = fx.poller.reconcile_once().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(fx.registry.get(&gid).unwrap().status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn test_magnet_handover_follows_new_gid() {
        let fx = fixture();
        let gid = track(&fx, "magnet:?xt=urn:btih:abc").await;
        let next = fx.engine.follow_with_new_transfer(&gid).unwrap();

        fx.poller.reconcile_once().await.unwrap();
        let task = fx.registry.get(&gid).unwrap();
        assert_eq!(task.id, gid);
        assert_eq!(task.engine_gid, next);
        assert_eq!(task.status, DownloadStatus::Active);
    }

    #[tokio::test]
    async fn test_fetch_failure_applies_nothing() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/a").await;
        fx.engine.forget(&gid);
        fx.engine.inject_failure(Some(InjectedFailure::Transient));

        assert!(fx.poller.reconcile_once().await.is_err());
        assert_eq!(fx.registry.get(&gid).unwrap().status, DownloadStatus::Queued);
        assert_eq!(fx.health.health().as_str(), "degraded");

        fx.engine.inject_failure(None);
        fx.poller.reconcile_once().await.unwrap();
        assert_eq!(fx.health.health(), EngineHealth::Healthy);
    }

    #[tokio::test]
    async fn test_retention_purges_old_finished() {
        let fx = fixture();
        let gid = track(&fx, "http://example.com/a").await;
        fx.registry
            .update(&gid, |t| {
                t.status = DownloadStatus::Completed;
                t.updated_at = Utc::now() - chrono::Duration::hours(3);
                Ok(())
            })
            .unwrap();

        let poller = Poller::new(fx.engine.clone(), Arc::clone(&fx.registry), Arc::clone(&fx.health))
            .with_retention(Some(Duration::from_secs(3600)));
        let report = poller.reconcile_once().await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(fx.registry.get(&gid).is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_halts_loop() {
        let fx = fixture();
        fx.engine.inject_failure(Some(InjectedFailure::Auth));
        let health = Arc::clone(&fx.health);
        let handle = fx.poller.with_interval(Duration::from_millis(10)).spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("poller should stop on auth failure");

        assert_eq!(health.health().as_str(), "auth_failed");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let fx = fixture();
        let engine = fx.engine.clone();
        let handle = fx.poller.with_interval(Duration::from_millis(10)).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown should complete");
        assert!(engine.calls().iter().any(|c| c == "aria2.tellActive"));
    }
}
