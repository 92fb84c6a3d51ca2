// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine RPC adapter.
//!
//! [`EngineRpc`] is the seam between orchestration and the download engine.
//! The production implementation is [`Aria2Client`], which speaks aria2's
//! JSON-RPC 2.0 dialect over HTTP. Tests substitute in-memory engines.
//!
//! # Example
//!
//! ```no_run
//! use harvester::rpc::{Aria2Client, EngineRpc, RpcSettings};
//!
//! # async fn example() -> harvester::error::HarvestResult<()> {
//! let client = Aria2Client::new(RpcSettings::new("http://127.0.0.1:6800/jsonrpc"))?;
//! let version = client.get_version().await?;
//! println!("aria2 {}", version.version);
//! # Ok(())
//! # }
//! ```

mod aria2;
pub mod memory;
pub mod types;

use std::path::Path;

use async_trait::async_trait;

use crate::error::HarvestResult;

pub use aria2::{Aria2Client, RpcSettings};
pub use memory::{InjectedFailure, MemoryEngine};
pub use types::{EngineState, EngineStatusSnapshot, EngineVersion, GlobalStat};

/// Engine options passed through to `addUri` (aria2 option names as keys).
pub type EngineOptions = serde_json::Map<String, serde_json::Value>;

/// Operations the orchestrator needs from the download engine.
#[async_trait]
pub trait EngineRpc: Send + Sync {
    /// Submit a new transfer. All `uris` are mirrors of the same content.
    /// Returns the engine-assigned GID.
    async fn add_uri(
        &self,
        uris: &[String],
        destination_dir: &Path,
        options: &EngineOptions,
    ) -> HarvestResult<String>;

    async fn pause(&self, gid: &str) -> HarvestResult<()>;

    async fn resume(&self, gid: &str) -> HarvestResult<()>;

    /// Force-remove an active or waiting transfer.
    async fn remove(&self, gid: &str) -> HarvestResult<()>;

    /// Forget a finished transfer's result.
    async fn remove_result(&self, gid: &str) -> HarvestResult<()>;

    async fn tell_status(&self, gid: &str) -> HarvestResult<EngineStatusSnapshot>;

    async fn tell_active(&self) -> HarvestResult<Vec<EngineStatusSnapshot>>;

    async fn tell_waiting(&self) -> HarvestResult<Vec<EngineStatusSnapshot>>;

    async fn tell_stopped(&self) -> HarvestResult<Vec<EngineStatusSnapshot>>;

    async fn get_version(&self) -> HarvestResult<EngineVersion>;

    async fn get_global_stat(&self) -> HarvestResult<GlobalStat>;
}
