// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine health as observed by the poller.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HarvestError;
use crate::sync::{resilient_read, resilient_write};

/// Overall engine connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineHealth {
    /// Last poll succeeded (or none has run yet)
    Healthy,
    /// Last poll failed; the poller keeps trying
    Degraded { last_error: String },
    /// Engine refused the secret; polling has stopped
    AuthFailed { error: String },
}

impl EngineHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "ok",
            Self::Degraded { .. } => "degraded",
            Self::AuthFailed { .. } => "auth_failed",
        }
    }
}

/// Point-in-time copy of the health record.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    #[serde(flatten)]
    pub health: EngineHealth,
    #[serde(rename = "last_successful_poll")]
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Shared health record written by the poller and read by the HTTP layer.
#[derive(Debug)]
pub struct HealthMonitor {
    inner: RwLock<HealthSnapshot>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HealthSnapshot {
                health: EngineHealth::Healthy,
                last_success: None,
                consecutive_failures: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        resilient_read(&self.inner).clone()
    }

    pub fn health(&self) -> EngineHealth {
        resilient_read(&self.inner).health.clone()
    }

    pub fn record_success(&self) {
        let mut inner = resilient_write(&self.inner);
        // Auth failures are sticky until the process restarts with a new secret
        if matches!(inner.health, EngineHealth::AuthFailed { .. }) {
            return;
        }
        inner.health = EngineHealth::Healthy;
        inner.last_success = Some(Utc::now());
        inner.consecutive_failures = 0;
    }

    /// Record a failed poll. Auth failures switch to `AuthFailed`.
    pub fn record_failure(&self, error: &HarvestError) {
        let mut inner = resilient_write(&self.inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.health = if error.is_fatal() {
            EngineHealth::AuthFailed { error: error.to_string() }
        } else if matches!(inner.health, EngineHealth::AuthFailed { .. }) {
            inner.health.clone()
        } else {
            EngineHealth::Degraded { last_error: error.to_string() }
        };
    }
}
