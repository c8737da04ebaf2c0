//! Health records for long-running services

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of one long-running service (port-forward, network overlay, hosts overlay)
///
/// Each record has exactly one owner that mutates it; everybody else gets a copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    /// Whether the service is currently healthy
    pub healthy: bool,

    /// Number of errors since the service was created
    pub error_count: u32,

    /// Reason of the most recent error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_reason: Option<String>,

    /// Time of the most recent error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
}

impl ServiceHealth {
    /// A healthy record with no error history
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    /// Mark healthy, keeping the error history
    pub fn record_success(&mut self) {
        self.healthy = true;
    }

    /// Mark unhealthy and remember why
    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.healthy = false;
        self.error_count = self.error_count.saturating_add(1);
        self.last_error_reason = Some(reason.into());
        self.last_error_time = Some(Utc::now());
    }
}
