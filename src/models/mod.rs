//! Data models for teltonika-monitor

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Router Readings
// ============================================================================

/// Values reported by the router in one read
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterReading {
    pub metrics: BTreeMap<String, f64>,
    pub attributes: BTreeMap<String, String>,
}

impl RouterReading {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.attributes.is_empty()
    }

    /// Shape the reading into rows, all stamped with the cycle time
    pub fn into_rows(
        self,
        host: &str,
        time: DateTime<Utc>,
    ) -> (Vec<TelemetrySample>, Vec<DeviceAttribute>) {
        let samples = self
            .metrics
            .into_iter()
            .map(|(metric, value)| TelemetrySample {
                time,
                host: host.to_string(),
                metric,
                value,
            })
            .collect();

        let attributes = self
            .attributes
            .into_iter()
            .map(|(name, value)| DeviceAttribute {
                time,
                host: host.to_string(),
                name,
                value,
            })
            .collect();

        (samples, attributes)
    }
}

// ============================================================================
// Stored Rows
// ============================================================================

/// One numeric measurement (row in teltonika_samples)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub time: DateTime<Utc>,
    pub host: String,
    pub metric: String,
    pub value: f64,
}

/// One textual value (row in teltonika_attributes)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceAttribute {
    pub time: DateTime<Utc>,
    pub host: String,
    pub name: String,
    pub value: String,
}

// ============================================================================
// Poll Cycles
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Success { samples: usize, attributes: usize },
    Failed { kind: &'static str, error: String },
}

/// Record of one connect-read-write attempt. Only logged, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct PollCycle {
    pub seq: u64,
    pub started_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
}

impl PollCycle {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Success { .. })
    }
}

/// Totals reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub cycles: u64,
    pub failed: u64,
}
