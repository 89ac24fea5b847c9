//! Statistics collection
//!
//! Aggregates deliveries from the delivery loop into session statistics.

use crate::{
    decoder::DecodedEvent,
    delivery::{Delivery, LossOrigin},
    types::{top_entries, LossStats, TraceStats},
};
use std::collections::HashMap;

/// Statistics collector fed with every delivery
#[derive(Default)]
pub struct StatsCollector {
    /// Field whose values are counted
    breakdown_field: Option<String>,
    /// Events per breakdown value
    breakdown: HashMap<String, u64>,
    total_events: u64,
    malformed: u64,
    gaps: u64,
    channel_lost: u64,
    kernel_lost: u64,
}

impl StatsCollector {
    /// Create a new statistics collector
    ///
    /// # Arguments
    ///
    /// * `breakdown_field` - Count events per value of this field
    pub fn new(breakdown_field: Option<String>) -> Self {
        Self {
            breakdown_field,
            ..Default::default()
        }
    }

    /// Add a delivery to the collector
    pub fn add(&mut self, delivery: &Delivery) {
        match delivery {
            Delivery::Event(event) => {
                self.total_events += 1;
                self.count_breakdown(event);
            }
            Delivery::Malformed { .. } => self.malformed += 1,
            Delivery::Gap { lost, origin } => {
                self.gaps += 1;
                match origin {
                    LossOrigin::Channel => self.channel_lost += lost,
                    LossOrigin::Kernel => self.kernel_lost += lost,
                }
            }
        }
    }

    fn count_breakdown(&mut self, event: &DecodedEvent) {
        let Some(field) = &self.breakdown_field else {
            return;
        };
        if let Some(value) = event.get(field) {
            *self.breakdown.entry(value.to_string()).or_insert(0) += 1;
        }
    }

    /// Generate session statistics
    ///
    /// # Arguments
    ///
    /// * `target_symbol` - Kernel function the probe was attached to
    /// * `elapsed_secs` - Duration of the session in seconds
    /// * `channel_overflow` - Final overflow counter of the event channel
    pub fn generate_stats(
        &self,
        target_symbol: &str,
        elapsed_secs: u64,
        channel_overflow: u64,
    ) -> TraceStats {
        TraceStats {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            target_symbol: target_symbol.to_string(),
            total_events: self.total_events,
            malformed_records: self.malformed,
            gap_notifications: self.gaps,
            loss: LossStats {
                channel_lost: self.channel_lost,
                kernel_lost: self.kernel_lost,
                channel_overflow,
            },
            breakdown_field: self.breakdown_field.clone(),
            breakdown: top_entries(&self.breakdown, None),
        }
    }

    /// Get current event count
    pub fn event_count(&self) -> u64 {
        self.total_events
    }

    /// Get records lost so far, all origins
    pub fn lost_count(&self) -> u64 {
        self.channel_lost + self.kernel_lost
    }

    /// Get number of distinct breakdown values
    pub fn breakdown_count(&self) -> usize {
        self.breakdown.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodeError, DecodedField, FieldValue};
    use chrono::Utc;

    fn event(sequence: u64, comm: &str) -> Delivery {
        Delivery::Event(DecodedEvent {
            sequence,
            captured_at: Utc::now(),
            fields: vec![
                DecodedField {
                    name: "pid".to_string(),
                    value: FieldValue::Unsigned(sequence + 100),
                },
                DecodedField {
                    name: "comm".to_string(),
                    value: FieldValue::Text(comm.to_string()),
                },
            ],
        })
    }

    #[test]
    fn test_collector_basic() {
        let mut collector = StatsCollector::new(Some("comm".to_string()));

        collector.add(&event(0, "bash"));
        collector.add(&event(1, "cat"));
        collector.add(&event(2, "bash"));

        assert_eq!(collector.event_count(), 3);
        assert_eq!(collector.breakdown_count(), 2);

        let stats = collector.generate_stats("do_sys_openat2", 10, 0);
        assert_eq!(stats.breakdown[0].value, "bash");
        assert_eq!(stats.breakdown[0].events, 2);
    }

    #[test]
    fn test_losses_by_origin() {
        let mut collector = StatsCollector::new(None);

        collector.add(&Delivery::Gap {
            lost: 5,
            origin: LossOrigin::Channel,
        });
        collector.add(&Delivery::Gap {
            lost: 2,
            origin: LossOrigin::Kernel,
        });
        collector.add(&Delivery::Malformed {
            sequence: 7,
            error: DecodeError::Malformed {
                sequence: 7,
                expected: 4,
                actual: 3,
            },
        });
        collector.add(&event(8, "bash"));

        let stats = collector.generate_stats("do_sys_openat2", 1, 5);
        assert_eq!(stats.gap_notifications, 2);
        assert_eq!(stats.malformed_records, 1);
        assert_eq!(
            stats.loss,
            LossStats {
                channel_lost: 5,
                kernel_lost: 2,
                channel_overflow: 5
            }
        );
        assert_eq!(collector.lost_count(), 7);
        assert!(stats.breakdown.is_empty());
    }

    #[test]
    fn test_missing_breakdown_field_is_ignored() {
        let mut collector = StatsCollector::new(Some("uid".to_string()));
        collector.add(&event(0, "bash"));

        assert_eq!(collector.event_count(), 1);
        assert_eq!(collector.breakdown_count(), 0);
    }
}
