// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! REST API server.
//!
//! # Endpoints
//!
//! - `GET /health` - Engine connectivity
//! - `GET /status` - Engine version, counters and download-root summary
//! - `GET|POST /downloads` - List or add downloads
//! - `GET|DELETE /downloads/:id` - Inspect or remove one download
//! - `POST /downloads/:id/{pause,resume,remove,retry}` - Lifecycle actions
//! - `GET /files?path=` - Browse the download root
//! - `POST /files/delete`, `POST /files/extract` - File operations
//! - `GET /files/download/*path` - Fetch a file
//! - `GET /extractions`, `GET /extractions/:id` - Extraction progress
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use harvester::server::{AppState, Server};
//!
//! # async fn example(state: Arc<AppState>) -> anyhow::Result<()> {
//! Server::new(state, 5000).start().await?;
//! # Ok(())
//! # }
//! ```

mod handlers;

pub use handlers::{AddDownloadRequest, DownloadView, HealthResponse, StatusResponse};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::timeout::TimeoutLayer;

use crate::files::FileManager;
use crate::orchestrator::Orchestrator;
use crate::poller::HealthMonitor;

/// Maximum accepted request body.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Per-request deadline; engine calls are bounded well below this.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Server state shared across handlers.
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub files: FileManager,
    pub health: Arc<HealthMonitor>,
    /// Reported on `/status`
    pub max_concurrent_downloads: u32,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, files: FileManager, health: Arc<HealthMonitor>) -> Self {
        Self {
            orchestrator,
            files,
            health,
            max_concurrent_downloads: 0,
            started_at: Instant::now(),
        }
    }

    pub fn with_max_concurrent_downloads(mut self, max: u32) -> Self {
        self.max_concurrent_downloads = max;
        self
    }
}

/// Build the API routes. Rate limiting is added by [`Server::start`].
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route(
            "/downloads",
            get(handlers::list_downloads).post(handlers::add_download),
        )
        .route(
            "/downloads/:id",
            get(handlers::get_download).delete(handlers::remove_download),
        )
        .route("/downloads/:id/pause", post(handlers::pause_download))
        .route("/downloads/:id/resume", post(handlers::resume_download))
        .route("/downloads/:id/remove", post(handlers::remove_download))
        .route("/downloads/:id/retry", post(handlers::retry_download))
        .route("/files", get(handlers::list_files))
        .route("/files/delete", post(handlers::delete_file))
        .route("/files/extract", post(handlers::extract_file))
        .route("/files/download/*path", get(handlers::download_file))
        .route("/extractions", get(handlers::list_extractions))
        .route("/extractions/:id", get(handlers::get_extraction))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// API server configuration.
pub struct Server {
    state: Arc<AppState>,
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
    rate_limit_per_minute: u32,
}

impl Server {
    /// Create a new server with the specified port.
    /// By default, binds to 127.0.0.1 (localhost only) for security.
    pub fn new(state: Arc<AppState>, port: u16) -> Self {
        Self {
            state,
            port,
            bind_address: "127.0.0.1".to_string(),
            rate_limit_per_minute: 60,
        }
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Requests per minute allowed per client IP.
    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute.max(1);
        self
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Routes plus the per-IP rate limiter.
    pub fn build_router(&self) -> Result<Router> {
        // Replenish one request every (60 / limit) seconds, bursting up to the limit
        let replenish_secs = u64::from((60 / self.rate_limit_per_minute).max(1));
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(replenish_secs)
                .burst_size(self.rate_limit_per_minute)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .ok_or_else(|| anyhow!("invalid rate limit configuration"))?,
        );

        Ok(router(Arc::clone(&self.state)).layer(GovernorLayer {
            config: governor_conf,
        }))
    }

    /// Start the server and run until SIGINT/SIGTERM.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router()?;
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);

        // Security warning if binding to all interfaces
        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API and the download directory to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow!(
                    "Port {} is already in use. Stop the other instance or choose another port with --port <PORT>",
                    self.port
                )
            } else {
                anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    // On Unix, listen for SIGINT and SIGTERM
    // On Windows, fall back to Ctrl+C only
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to install signal handlers: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
