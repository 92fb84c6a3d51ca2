// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! aria2 JSON-RPC client.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use super::types::{WireGlobalStat, WireStatus, STATUS_KEYS};
use super::{EngineOptions, EngineRpc, EngineStatusSnapshot, EngineVersion, GlobalStat};
use crate::error::{HarvestError, HarvestResult};

/// Default timeout for a single RPC request (in seconds).
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default TCP connect timeout (in seconds).
const CONNECT_TIMEOUT_SECS: u64 = 3;

/// Attempts per call, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum delay for exponential backoff (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 10000;

/// Default page size for `tellWaiting` / `tellStopped`.
const LIST_PAGE_SIZE: u64 = 1000;

/// Connection settings for [`Aria2Client`].
#[derive(Debug, Clone)]
pub struct RpcSettings {
    /// Full endpoint URL, e.g. `http://127.0.0.1:6800/jsonrpc`
    pub endpoint: String,
    /// Shared secret (`--rpc-secret`)
    pub secret: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Attempts per call for transient failures (minimum 1)
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    /// Entries requested per `tellWaiting` / `tellStopped` page (minimum 1)
    pub list_page_size: u64,
}

impl RpcSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: None,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_attempts: MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            list_page_size: LIST_PAGE_SIZE,
        }
    }

    /// Set the shared secret. Empty strings mean "no secret".
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_timeouts(mut self, request: Duration, connect: Duration) -> Self {
        self.request_timeout = request;
        self.connect_timeout = connect;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_list_page_size(mut self, size: u64) -> Self {
        self.list_page_size = size.max(1);
        self
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Client for an aria2 instance running with `--enable-rpc`.
pub struct Aria2Client {
    client: reqwest::Client,
    settings: RpcSettings,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Aria2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aria2Client")
            .field("endpoint", &self.settings.endpoint)
            .field("secret", &self.settings.secret.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Aria2Client {
    /// Create a client. Fails only if the HTTP stack cannot be initialized.
    pub fn new(settings: RpcSettings) -> HarvestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| {
                HarvestError::TransientRpcFailure(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            settings,
            next_id: AtomicU64::new(1),
        })
    }

    /// Get the endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// Perform a call with automatic retry and exponential backoff.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> HarvestResult<T> {
        let mut full_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.settings.secret {
            full_params.push(Value::String(format!("token:{}", secret)));
        }
        full_params.extend(params);

        let attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                // Exponential backoff: base, 2x base, 4x base, ... capped at 10s
                let delay = std::cmp::min(
                    self.settings.retry_base_delay.as_millis() as u64 * (1 << (attempt - 1)),
                    RETRY_MAX_DELAY_MS,
                );
                tracing::debug!(
                    target: "harvester::rpc",
                    method,
                    "Retry attempt {} after {}ms delay",
                    attempt + 1,
                    delay
                );
                sleep(Duration::from_millis(delay)).await;
            }

            match self.call_once(method, &full_params).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    tracing::debug!(target: "harvester::rpc", method, error = %e, "transient RPC failure");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &str, params: &[Value]) -> HarvestResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": format!("harvester-{}", id),
            "method": method,
            "params": params,
        });

        let response = match self.client.post(&self.settings.endpoint).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let msg = if e.is_timeout() {
                    "request timed out".to_string()
                } else if e.is_connect() {
                    format!("failed to connect to engine: {}", e)
                } else {
                    format!("network error: {}", e)
                };
                return Err(HarvestError::TransientRpcFailure(msg));
            }
        };

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(HarvestError::RpcAuthFailure("engine returned HTTP 401".into()));
        }
        if status.is_server_error() {
            return Err(HarvestError::TransientRpcFailure(format!("engine returned HTTP {}", status)));
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                HarvestError::TransientRpcFailure("timed out reading response".into())
            } else {
                HarvestError::RpcProtocolError(format!("failed to read response body: {}", e))
            }
        })?;

        // aria2 reports call errors with HTTP 400 and a JSON-RPC error body,
        // so the body is decoded regardless of the status code.
        let decoded: RpcResponse = serde_json::from_str(&text).map_err(|e| {
            HarvestError::RpcProtocolError(format!("HTTP {} with undecodable body: {}", status, e))
        })?;

        if let Some(err) = decoded.error {
            if err.message == "Unauthorized" {
                return Err(HarvestError::RpcAuthFailure(err.message));
            }
            return Err(HarvestError::EngineRejected {
                code: err.code,
                message: err.message,
            });
        }

        let result = decoded
            .result
            .ok_or_else(|| HarvestError::RpcProtocolError(format!("{} response has no result", method)))?;
        serde_json::from_value(result)
            .map_err(|e| HarvestError::RpcProtocolError(format!("unexpected {} result: {}", method, e)))
    }

    async fn tell_list(&self, method: &str, params: Vec<Value>) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        let entries: Vec<WireStatus> = self.call(method, params).await?;
        entries.into_iter().map(WireStatus::into_snapshot).collect()
    }

    /// Walk an offset/num list method until a short page comes back.
    ///
    /// The engine's lists can shift between pages, so entries are deduplicated
    /// by gid and a page with nothing new ends the walk.
    async fn tell_paged(&self, method: &str) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        let page_size = self.settings.list_page_size.max(1);
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        let mut offset = 0u64;
        loop {
            let page = self
                .tell_list(method, vec![json!(offset), json!(page_size), json!(STATUS_KEYS)])
                .await?;
            let received = page.len() as u64;
            let before = all.len();
            all.extend(page.into_iter().filter(|s| seen.insert(s.gid.clone())));
            if received < page_size || all.len() == before {
                break;
            }
            offset += received;
        }
        Ok(all)
    }
}

#[async_trait]
impl EngineRpc for Aria2Client {
    async fn add_uri(
        &self,
        uris: &[String],
        destination_dir: &Path,
        options: &EngineOptions,
    ) -> HarvestResult<String> {
        let mut opts = options.clone();
        opts.insert(
            "dir".to_string(),
            Value::String(destination_dir.to_string_lossy().into_owned()),
        );
        self.call("aria2.addUri", vec![json!(uris), Value::Object(opts)]).await
    }

    async fn pause(&self, gid: &str) -> HarvestResult<()> {
        self.call::<String>("aria2.pause", vec![json!(gid)]).await.map(|_| ())
    }

    async fn resume(&self, gid: &str) -> HarvestResult<()> {
        self.call::<String>("aria2.unpause", vec![json!(gid)]).await.map(|_| ())
    }

    async fn remove(&self, gid: &str) -> HarvestResult<()> {
        self.call::<String>("aria2.forceRemove", vec![json!(gid)]).await.map(|_| ())
    }

    async fn remove_result(&self, gid: &str) -> HarvestResult<()> {
        self.call::<String>("aria2.removeDownloadResult", vec![json!(gid)])
            .await
            .map(|_| ())
    }

    async fn tell_status(&self, gid: &str) -> HarvestResult<EngineStatusSnapshot> {
        let wire: WireStatus = self
            .call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await?;
        wire.into_snapshot()
    }

    async fn tell_active(&self) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        self.tell_list("aria2.tellActive", vec![json!(STATUS_KEYS)]).await
    }

    async fn tell_waiting(&self) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        self.tell_paged("aria2.tellWaiting").await
    }

    async fn tell_stopped(&self) -> HarvestResult<Vec<EngineStatusSnapshot>> {
        self.tell_paged("aria2.tellStopped").await
    }

    async fn get_version(&self) -> HarvestResult<EngineVersion> {
        self.call("aria2.getVersion", vec![]).await
    }

    async fn get_global_stat(&self) -> HarvestResult<GlobalStat> {
        let wire: WireGlobalStat = self.call("aria2.getGlobalStat", vec![]).await?;
        wire.into_stat()
    }
}
