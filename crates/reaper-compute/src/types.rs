//! Wire and outcome types for compute calls.
//!
//! `Operation` and `InstanceRef` mirror the subset of the Compute Engine
//! JSON resources that a suspend run reads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use reaper_core::Hostname;

use crate::error::is_throttling;

// ── Operations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Done,
}

/// A provider long-running operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    /// Zone URL for zonal operations.
    #[serde(default)]
    pub zone: Option<String>,
    /// Region URL for regional operations.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub target_link: Option<String>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationErrorItem {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }

    /// Zone name, e.g. `us-central1-a`.
    pub fn zone_name(&self) -> Option<&str> {
        self.zone.as_deref().map(last_segment)
    }

    /// Region name, e.g. `us-central1`.
    pub fn region_name(&self) -> Option<&str> {
        self.region.as_deref().map(last_segment)
    }

    /// Joined error messages, if the operation finished with errors.
    pub fn error_message(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        let joined = errors
            .iter()
            .map(|e| match (&e.code, &e.message) {
                (Some(code), Some(msg)) => format!("{code}: {msg}"),
                (None, Some(msg)) => msg.clone(),
                (Some(code), None) => code.clone(),
                (None, None) => "unknown error".to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        Some(joined)
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// An instance as returned by an inventory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub name: String,
    /// Zone URL.
    pub zone: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl InstanceRef {
    pub fn zone_name(&self) -> &str {
        last_segment(&self.zone)
    }
}

// ── Deletes ────────────────────────────────────────────────────────

/// One instance delete, correlated by hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub hostname: Hostname,
    pub zone: String,
}

impl DeleteRequest {
    pub fn new(hostname: impl Into<Hostname>, zone: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            zone: zone.into(),
        }
    }
}

/// Terminal outcome of one request inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Accepted; the operation tracks the actual deletion.
    Accepted(Operation),
    /// Rejected for rate or quota reasons. Worth retrying.
    Throttled(String),
    /// Rejected for any other reason.
    Failed(String),
}

impl RequestOutcome {
    /// Classify a per-request error message.
    pub fn from_error(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_throttling(&message) {
            RequestOutcome::Throttled(message)
        } else {
            RequestOutcome::Failed(message)
        }
    }
}

/// Outcomes of one batch, keyed by request hostname.
pub type BatchOutcome = HashMap<Hostname, RequestOutcome>;

/// Last `/`-separated segment of a resource URL.
pub fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
