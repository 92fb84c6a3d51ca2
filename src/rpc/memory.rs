// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory engine.
//!
//! Behaves like a small aria2 instance: GIDs are 16 hex digits, paused
//! transfers are reported by `tellWaiting`, finished ones by `tellStopped`
//! until their result is removed. Used by the test suites to drive the
//! orchestrator and poller without a running daemon.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;

use super::{EngineOptions, EngineRpc, EngineState, EngineStatusSnapshot, EngineVersion, GlobalStat};
use crate::error::{HarvestError, HarvestResult};

/// Failure injected into every subsequent call until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Protocol,
    Auth,
    Rejected,
}

impl InjectedFailure {
    fn to_error(self) -> HarvestError {
        match self {
            Self::Transient => HarvestError::TransientRpcFailure("connection refused".into()),
            Self::Protocol => HarvestError::RpcProtocolError("garbage response".into()),
            Self::Auth => HarvestError::RpcAuthFailure("Unauthorized".into()),
            Self::Rejected => HarvestError::EngineRejected {
                code: 1,
                message: "engine said no".into(),
            },
        }
    }
}

/// One transfer as the in-memory engine sees it.
#[derive(Debug, Clone)]
pub struct MemoryTransfer {
    pub uris: Vec<String>,
    pub dir: PathBuf,
    pub options: EngineOptions,
    pub state: EngineState,
    pub completed_length: u64,
    pub total_length: u64,
    pub download_speed: u64,
    pub name: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub followed_by: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    transfers: IndexMap<String, MemoryTransfer>,
    next_gid: u64,
    failure: Option<InjectedFailure>,
    calls: Vec<String>,
}

/// In-memory [`EngineRpc`] implementation.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
}

fn not_found(gid: &str) -> HarvestError {
    HarvestError::EngineRejected {
        code: 1,
        message: format!("GID {} is not found", gid),
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and fail it if a failure is injected.
    fn enter(&self, method: &str) -> HarvestResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        state.calls.push(method.to_string());
        match state.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(state),
        }
    }

    /// Make every following call fail (or succeed again with `None`).
    pub fn inject_failure(&self, failure: Option<InjectedFailure>) {
        self.lock().failure = failure;
    }

    /// Method names received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn transfer(&self, gid: &str) -> Option<MemoryTransfer> {
        self.lock().transfers.get(gid).cloned()
    }

    pub fn gids(&self) -> Vec<String> {
        self.lock().transfers.keys().cloned().collect()
    }

    pub fn set_state(&self, gid: &str, state: EngineState) {
        if let Some(t) = self.lock().transfers.get_mut(gid) {
            t.state = state;
        }
    }

    pub fn set_progress(&self, gid: &str, completed: u64, total: u64, speed: u64) {
        if let Some(t) = self.lock().transfers.get_mut(gid) {
            t.completed_length = completed;
            t.total_length = total;
            t.download_speed = speed;
        }
    }

    pub fn set_name(&self, gid: &str, name: &str) {
        if let Some(t) = self.lock().transfers.get_mut(gid) {
            t.name = Some(name.to_string());
        }
    }

    /// Put a transfer into the engine's `error` state.
    pub fn fail_transfer(&self, gid: &str, code: &str, message: &str) {
        if let Some(t) = self.lock().transfers.get_mut(gid) {
            t.state = EngineState::Error;
            t.download_speed = 0;
            t.error_code = Some(code.to_string());
            t.error_message = Some(message.to_string());
        }
    }

    /// Complete a metadata transfer and hand over to a new GID, the way
    /// aria2 does for magnet links.
    pub fn follow_with_new_transfer(&self, gid: &str) -> Option<String> {
        let mut state = self.lock();
        let mut successor = state.transfers.get(gid)?.clone();
        state.next_gid += 1;
        let new_gid = format!("{:016x}", state.next_gid);
        successor.state = EngineState::Active;
        successor.followed_by.clear();
        if let Some(t) = state.transfers.get_mut(gid) {
            t.state = EngineState::Complete;
            t.followed_by = vec![new_gid.clone()];
        }
        state.transfers.insert(new_gid.clone(), successor);
        Some(new_gid)
    }

    /// Drop a transfer without trace, as if the daemon restarted.
    pub fn forget(&self, gid: &str) {
        self.lock().transfers.shift_remove(gid);
    }

    fn snapshot(gid: &str, t: &MemoryTransfer) -> EngineStatusSnapshot {
        EngineStatusSnapshot {
            gid: gid.to_string(),
            state: t.state,
            completed_length: t.completed_length,
            total_length: t.total_length,
            download_speed: t.download_speed,
            name: t.name.clone(),
            error_code: t.error_code.clone(),
            error_message: t.error_message.clone(),
            followed_by: t.followed_by.clone(),
        }
    }

    fn list(&self, method: &str, states: &[EngineState]) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        let state = self.enter(method)?;
        Ok(state
            .transfers
            .iter()
            .filter(|(_, t)| states.contains(&t.state))
            .map(|(gid, t)| Self::snapshot(gid, t))
            .collect())
    }
}

#[async_trait]
impl EngineRpc for MemoryEngine {
    async fn add_uri(
        &self,
        uris: &[String],
        destination_dir: &Path,
        options: &EngineOptions,
    ) -> HarvestResult<String> {
        let mut state = self.enter("aria2.addUri")?;
        if uris.is_empty() {
            return Err(HarvestError::EngineRejected {
                code: 1,
                message: "No URI to download.".into(),
            });
        }
        state.next_gid += 1;
        let gid = format!("{:016x}", state.next_gid);
        state.transfers.insert(
            gid.clone(),
            MemoryTransfer {
                uris: uris.to_vec(),
                dir: destination_dir.to_path_buf(),
                options: options.clone(),
                state: EngineState::Waiting,
                completed_length: 0,
                total_length: 0,
                download_speed: 0,
                name: None,
                error_code: None,
                error_message: None,
                followed_by: Vec::new(),
            },
        );
        Ok(gid)
    }

    async fn pause(&self, gid: &str) -> HarvestResult<()> {
        let mut state = self.enter("aria2.pause")?;
        let t = state.transfers.get_mut(gid).ok_or_else(|| not_found(gid))?;
        match t.state {
            EngineState::Active | EngineState::Waiting => {
                t.state = EngineState::Paused;
                t.download_speed = 0;
                Ok(())
            }
            _ => Err(HarvestError::EngineRejected {
                code: 1,
                message: format!("GID#{} cannot be paused now", gid),
            }),
        }
    }

    async fn resume(&self, gid: &str) -> HarvestResult<()> {
        let mut state = self.enter("aria2.unpause")?;
        let t = state.transfers.get_mut(gid).ok_or_else(|| not_found(gid))?;
        match t.state {
            EngineState::Paused => {
                t.state = EngineState::Waiting;
                Ok(())
            }
            _ => Err(HarvestError::EngineRejected {
                code: 1,
                message: format!("GID#{} cannot be unpaused now", gid),
            }),
        }
    }

    async fn remove(&self, gid: &str) -> HarvestResult<()> {
        let mut state = self.enter("aria2.forceRemove")?;
        let t = state.transfers.get_mut(gid).ok_or_else(|| not_found(gid))?;
        match t.state {
            EngineState::Active | EngineState::Waiting | EngineState::Paused => {
                t.state = EngineState::Removed;
                t.download_speed = 0;
                Ok(())
            }
            _ => Err(HarvestError::EngineRejected {
                code: 1,
                message: format!("Active Download not found for GID#{}", gid),
            }),
        }
    }

    async fn remove_result(&self, gid: &str) -> HarvestResult<()> {
        let mut state = self.enter("aria2.removeDownloadResult")?;
        let current = state.transfers.get(gid).map(|t| t.state);
        match current {
            Some(EngineState::Complete | EngineState::Error | EngineState::Removed) => {
                state.transfers.shift_remove(gid);
                Ok(())
            }
            Some(_) => Err(HarvestError::EngineRejected {
                code: 1,
                message: format!("Could not remove download result of GID#{}", gid),
            }),
            None => Err(not_found(gid)),
        }
    }

    async fn tell_status(&self, gid: &str) -> HarvestResult<EngineStatusSnapshot> {
        let state = self.enter("aria2.tellStatus")?;
        let t = state.transfers.get(gid).ok_or_else(|| not_found(gid))?;
        Ok(Self::snapshot(gid, t))
    }

    async fn tell_active(&self) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        self.list("aria2.tellActive", &[EngineState::Active])
    }

    async fn tell_waiting(&self) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        self.list("aria2.tellWaiting", &[EngineState::Waiting, EngineState::Paused])
    }

    async fn tell_stopped(&self) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        self.list(
            "aria2.tellStopped",
            &[EngineState::Complete, EngineState::Error, EngineState::Removed],
        )
    }

    async fn get_version(&self) -> HarvestResult<EngineVersion> {
        drop(self.enter("aria2.getVersion")?);
        Ok(EngineVersion {
            version: "1.37.0".into(),
            enabled_features: vec!["BitTorrent".into(), "Metalink".into()],
        })
    }

    async fn get_global_stat(&self) -> HarvestResult<GlobalStat> {
        let state = self.enter("aria2.getGlobalStat")?;
        let mut stat = GlobalStat::default();
        for t in state.transfers.values() {
            match t.state {
                EngineState::Active => {
                    stat.num_active += 1;
                    stat.download_speed += t.download_speed;
                }
                EngineState::Waiting | EngineState::Paused => stat.num_waiting += 1,
                _ => stat.num_stopped += 1,
            }
        }
        Ok(stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_lists() {
        let engine = MemoryEngine::new();
        let gid = engine
            .add_uri(&["http://example.com/a".into()], Path::new("/dl"), &EngineOptions::new())
            .await
            .unwrap();
        assert_eq!(gid.len(), 16);
        assert_eq!(engine.tell_waiting().await.unwrap().len(), 1);

        engine.set_state(&gid, EngineState::Active);
        assert_eq!(engine.tell_active().await.unwrap()[0].gid, gid);

        engine.remove(&gid).await.unwrap();
        assert_eq!(engine.tell_stopped().await.unwrap()[0].state, EngineState::Removed);
        engine.remove_result(&gid).await.unwrap();
        assert!(engine.tell_status(&gid).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_applies_until_cleared() {
        let engine = MemoryEngine::new();
        engine.inject_failure(Some(InjectedFailure::Auth));
        assert!(engine.get_version().await.unwrap_err().is_fatal());
        engine.inject_failure(None);
        assert!(engine.get_version().await.is_ok());
        assert_eq!(engine.calls(), vec!["aria2.getVersion", "aria2.getVersion"]);
    }

    #[tokio::test]
    async fn test_version_call_releases_state() {
        let engine = MemoryEngine::new();
        let (a, b) = tokio::join!(engine.get_version(), engine.get_version());
        assert!(a.is_ok() && b.is_ok());
        engine.inject_failure(Some(InjectedFailure::Transient));
        assert_eq!(engine.calls().len(), 2);
        assert!(engine.get_global_stat().await.is_err());
    }
}
