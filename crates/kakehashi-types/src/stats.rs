//! Skill execution statistics as reported on the wire.

use serde::{Deserialize, Serialize};

/// Point-in-time view of the skill executor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Cumulative wall-clock seconds.
    pub total_time: f64,
    /// `total_time / total`, or 0 when nothing has run.
    pub average_time: f64,
    /// `succeeded / total`, or 0 when nothing has run.
    pub success_rate: f64,
}
