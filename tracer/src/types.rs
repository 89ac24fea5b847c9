//! Userspace type definitions
//!
//! Defines the data structures used for trace statistics and export.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregated statistics of one tracing session
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TraceStats {
    /// ISO 8601 timestamp when statistics were generated
    pub timestamp: String,
    /// Duration of the session in seconds
    pub duration_seconds: u64,
    /// Kernel function the probe was attached to
    pub target_symbol: String,
    /// Events decoded and delivered
    pub total_events: u64,
    /// Records that failed decoding
    pub malformed_records: u64,
    /// Gap notifications delivered
    pub gap_notifications: u64,
    /// Lost record accounting
    pub loss: LossStats,
    /// Field the breakdown is keyed by
    pub breakdown_field: Option<String>,
    /// Events per value of the breakdown field, most frequent first
    pub breakdown: Vec<BreakdownEntry>,
}

impl TraceStats {
    /// Average delivered events per second
    pub fn events_per_second(&self) -> f64 {
        if self.duration_seconds == 0 {
            return self.total_events as f64;
        }
        self.total_events as f64 / self.duration_seconds as f64
    }
}

/// Lost record statistics
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct LossStats {
    /// Records overwritten in the event channel, as reported through gaps
    pub channel_lost: u64,
    /// Records the kernel transport dropped
    pub kernel_lost: u64,
    /// Overflow counter of the event channel at shutdown
    pub channel_overflow: u64,
}

impl LossStats {
    pub fn total(&self) -> u64 {
        self.channel_lost + self.kernel_lost
    }
}

/// Event count for one value of the breakdown field
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BreakdownEntry {
    pub value: String,
    pub events: u64,
}

/// Sort per-value counts, most frequent first
///
/// Ties are ordered by value so the output is stable.
///
/// # Arguments
///
/// * `counts` - Events per value
/// * `limit` - Keep at most this many entries (`None` keeps all)
pub fn top_entries(counts: &HashMap<String, u64>, limit: Option<usize>) -> Vec<BreakdownEntry> {
    let mut entries: Vec<BreakdownEntry> = counts
        .iter()
        .map(|(value, &events)| BreakdownEntry {
            value: value.clone(),
            events,
        })
        .collect();

    entries.sort_by(|a, b| b.events.cmp(&a.events).then_with(|| a.value.cmp(&b.value)));
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    entries
}
