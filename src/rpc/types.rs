// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! aria2 wire shapes and their translation into engine snapshots.
//!
//! aria2 encodes every number as a decimal string and nests the display name
//! under `bittorrent.info.name` or the first file path. Nothing in here is
//! visible outside the `rpc` module except the translated types.

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};

/// Keys requested from the bulk `tell*` queries.
pub(crate) const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorCode",
    "errorMessage",
    "files",
    "bittorrent",
    "followedBy",
];

/// Engine-side state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
}

impl EngineState {
    fn parse(raw: &str) -> HarvestResult<Self> {
        match raw {
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "removed" => Ok(Self::Removed),
            other => Err(HarvestError::RpcProtocolError(format!(
                "unknown engine status '{}'",
                other
            ))),
        }
    }
}

/// Point-in-time engine report for one GID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatusSnapshot {
    pub gid: String,
    pub state: EngineState,
    pub completed_length: u64,
    /// Zero means the engine does not know the size yet
    pub total_length: u64,
    pub download_speed: u64,
    pub name: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// GIDs the engine spawned to continue this transfer (magnet metadata)
    pub followed_by: Vec<String>,
}

/// Engine build information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub version: String,
    #[serde(rename = "enabledFeatures", default)]
    pub enabled_features: Vec<String>,
}

/// Aggregate engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStat {
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_active: u64,
    pub num_waiting: u64,
    pub num_stopped: u64,
}

// ----------------------------------------------------------------------
// Wire structs
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireStatus {
    gid: Option<String>,
    status: Option<String>,
    total_length: Option<String>,
    completed_length: Option<String>,
    download_speed: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    #[serde(default)]
    files: Vec<WireFile>,
    bittorrent: Option<WireBittorrent>,
    #[serde(default)]
    followed_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireFile {
    #[serde(default)]
    path: String,
    #[serde(default)]
    uris: Vec<WireUri>,
}

#[derive(Debug, Deserialize)]
struct WireUri {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct WireBittorrent {
    info: Option<WireTorrentInfo>,
}

#[derive(Debug, Deserialize)]
struct WireTorrentInfo {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireGlobalStat {
    download_speed: String,
    upload_speed: String,
    num_active: String,
    num_waiting: String,
    num_stopped: String,
}

fn parse_count(field: &str, raw: Option<&str>) -> HarvestResult<u64> {
    match raw {
        None | Some("") => Ok(0),
        Some(value) => value.parse::<u64>().map_err(|_| {
            HarvestError::RpcProtocolError(format!("field {} is not a number: '{}'", field, value))
        }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl WireStatus {
    /// Display name: torrent name, then first file name, then last URI segment.
    fn display_name(&self) -> Option<String> {
        if let Some(name) = self
            .bittorrent
            .as_ref()
            .and_then(|bt| bt.info.as_ref())
            .and_then(|info| info.name.clone())
            .filter(|n| !n.is_empty())
        {
            return Some(name);
        }

        let first = self.files.first()?;
        if !first.path.is_empty() {
            let name = first.path.rsplit(['/', '\\']).next().unwrap_or(first.path.as_str());
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
        first
            .uris
            .first()
            .and_then(|u| u.uri.split(['?', '#']).next())
            .and_then(|u| u.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
    }

    pub(crate) fn into_snapshot(self) -> HarvestResult<EngineStatusSnapshot> {
        let gid = non_empty(self.gid.clone())
            .ok_or_else(|| HarvestError::RpcProtocolError("status entry without gid".into()))?;
        let state = EngineState::parse(self.status.as_deref().ok_or_else(|| {
            HarvestError::RpcProtocolError(format!("status entry {} without status", gid))
        })?)?;

        let name = self.display_name();
        // "0" is aria2's "no error"
        let error_code = non_empty(self.error_code).filter(|c| c != "0");

        Ok(EngineStatusSnapshot {
            gid,
            state,
            completed_length: parse_count("completedLength", self.completed_length.as_deref())?,
            total_length: parse_count("totalLength", self.total_length.as_deref())?,
            download_speed: parse_count("downloadSpeed", self.download_speed.as_deref())?,
            name,
            error_code,
            error_message: non_empty(self.error_message),
            followed_by: self.followed_by,
        })
    }
}

impl WireGlobalStat {
    pub(crate) fn into_stat(self) -> HarvestResult<GlobalStat> {
        Ok(GlobalStat {
            download_speed: parse_count("downloadSpeed", Some(&self.download_speed))?,
            upload_speed: parse_count("uploadSpeed", Some(&self.upload_speed))?,
            num_active: parse_count("numActive", Some(&self.num_active))?,
            num_waiting: parse_count("numWaiting", Some(&self.num_waiting))?,
            num_stopped: parse_count("numStopped", Some(&self.num_stopped))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> HarvestResult<EngineStatusSnapshot> {
        serde_json::from_value::<WireStatus>(value)
            .expect("wire shape")
            .into_snapshot()
    }

    #[test]
    fn test_http_transfer_translation() {
        let snap = decode(json!({
            "gid": "2089b05ecca3d829",
            "status": "active",
            "totalLength": "34896138",
            "completedLength": "1048576",
            "downloadSpeed": "524288",
            "errorCode": "0",
            "files": [{
                "path": "/downloads/isos/debian.iso",
                "uris": [{"uri": "http://example.com/debian.iso", "status": "used"}]
            }]
        }))
        .unwrap();

        assert_eq!(snap.state, EngineState::Active);
        assert_eq!(snap.total_length, 34896138);
        assert_eq!(snap.completed_length, 1048576);
        assert_eq!(snap.download_speed, 524288);
        assert_eq!(snap.name.as_deref(), Some("debian.iso"));
        assert_eq!(snap.error_code, None);
    }

    #[test]
    fn test_torrent_name_wins() {
        let snap = decode(json!({
            "gid": "a1",
            "status": "waiting",
            "bittorrent": {"info": {"name": "ubuntu-24.04"}},
            "files": [{"path": "/downloads/ubuntu-24.04/disk.iso", "uris": []}]
        }))
        .unwrap();
        assert_eq!(snap.name.as_deref(), Some("ubuntu-24.04"));
        assert_eq!(snap.total_length, 0);
    }

    #[test]
    fn test_name_falls_back_to_uri_before_path_is_known() {
        let snap = decode(json!({
            "gid": "a1",
            "status": "waiting",
            "files": [{"path": "", "uris": [{"uri": "https://example.com/pub/file.tar.gz?token=x"}]}]
        }))
        .unwrap();
        assert_eq!(snap.name.as_deref(), Some("file.tar.gz"));
    }

    #[test]
    fn test_error_fields() {
        let snap = decode(json!({
            "gid": "a1",
            "status": "error",
            "errorCode": "3",
            "errorMessage": "Resource not found"
        }))
        .unwrap();
        assert_eq!(snap.state, EngineState::Error);
        assert_eq!(snap.error_code.as_deref(), Some("3"));
        assert_eq!(snap.error_message.as_deref(), Some("Resource not found"));
    }

    #[test]
    fn test_malformed_entries_are_protocol_errors() {
        assert!(matches!(
            decode(json!({"gid": "a1", "status": "exploded"})),
            Err(HarvestError::RpcProtocolError(_))
        ));
        assert!(matches!(
            decode(json!({"status": "active"})),
            Err(HarvestError::RpcProtocolError(_))
        ));
        assert!(matches!(
            decode(json!({"gid": "a1", "status": "active", "totalLength": "lots"})),
            Err(HarvestError::RpcProtocolError(_))
        ));
    }

    #[test]
    fn test_global_stat() {
        let wire: WireGlobalStat = serde_json::from_value(json!({
            "downloadSpeed": "1024",
            "uploadSpeed": "0",
            "numActive": "2",
            "numWaiting": "1",
            "numStopped": "7",
            "numStoppedTotal": "7"
        }))
        .unwrap();
        let stat = wire.into_stat().unwrap();
        assert_eq!(stat.download_speed, 1024);
        assert_eq!(stat.num_active, 2);
        assert_eq!(stat.num_stopped, 7);
    }
}
