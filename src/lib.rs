// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! harvester - Download orchestration for the aria2 engine
//!
//! Hands transfers to an aria2 daemon over JSON-RPC, keeps its own registry
//! of every download in sync with the engine, and manages the files that
//! land in a single download root.
//!
//! # Core Modules
//!
//! - [`rpc`] - aria2 JSON-RPC client and the [`rpc::EngineRpc`] seam
//! - [`registry`] - Thread-safe store of downloads and extraction tasks
//! - [`poller`] - Background reconciliation against the engine
//! - [`orchestrator`] - Add, pause, resume, remove and retry downloads
//! - [`files`] - Browse, delete and extract files under the download root
//! - [`server`] - REST API
//! - [`config`] - File, environment and flag configuration
//! - [`error`] / [`errors`] - Domain errors and their HTTP envelopes

pub mod config;
pub mod error;
pub mod errors;
pub mod files;
pub mod orchestrator;
pub mod paths;
pub mod poller;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod sync;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{HarvestError, HarvestResult};
pub use files::FileManager;
pub use orchestrator::Orchestrator;
pub use paths::DownloadRoot;
pub use poller::{HealthMonitor, Poller, PollerHandle};
pub use registry::Registry;
pub use rpc::{Aria2Client, EngineRpc, MemoryEngine};
pub use types::{
    ArchiveFormat, DownloadFilter, DownloadStatus, DownloadTask, ExtractionStatus, ExtractionTask,
};
