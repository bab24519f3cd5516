//! Aggregates pass/limit telemetry drained from windows into a form a
//! metrics sink can export. This crate does not ship a metrics exporter —
//! matching the ambient-stack split used elsewhere (traits for transport,
//! registry, resolution) — but the aggregation itself, and the `tracing`
//! events emitted alongside it, are real.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::model::RuleId;
use crate::window::WindowRecord;

/// Cumulative counters for one `(rule, duration)` pair since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionTotals {
    pub pass: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default)]
struct RuleTotals {
    by_duration: HashMap<Duration, DimensionTotals>,
    traffic_shaping_limited: u64,
}

/// Collects [`WindowRecord`]s drained on the manager's reporting cadence and
/// keeps a running total per rule, for export or inspection.
#[derive(Default)]
pub struct Recorder {
    totals: Mutex<HashMap<RuleId, RuleTotals>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `CollectRecord` for one window: merges its drained counters into the
    /// running totals and emits a `tracing` event for anything non-zero.
    pub fn record(&self, rule_id: &RuleId, record: &WindowRecord) {
        let mut totals = self.totals.lock();
        let entry = totals.entry(rule_id.clone()).or_default();

        for (duration, pass, limit) in &record.per_duration {
            let dim = entry.by_duration.entry(*duration).or_default();
            dim.pass += pass;
            dim.limit += limit;
            if *limit > 0 {
                tracing::info!(
                    rule_id = ?rule_id,
                    duration_ms = duration.as_millis() as u64,
                    pass,
                    limit,
                    "rate limit window drained",
                );
            }
        }
        if record.traffic_shaping_limited > 0 {
            entry.traffic_shaping_limited += record.traffic_shaping_limited;
            tracing::info!(
                rule_id = ?rule_id,
                rejected = record.traffic_shaping_limited,
                "traffic shaping bucket rejected requests",
            );
        }
    }

    /// Snapshot of a rule's cumulative totals, keyed by amount duration.
    pub fn totals_for(&self, rule_id: &RuleId) -> Vec<(Duration, DimensionTotals)> {
        self.totals
            .lock()
            .get(rule_id)
            .map(|t| t.by_duration.iter().map(|(d, v)| (*d, *v)).collect())
            .unwrap_or_default()
    }

    pub fn traffic_shaping_limited_for(&self, rule_id: &RuleId) -> u64 {
        self.totals
            .lock()
            .get(rule_id)
            .map(|t| t.traffic_shaping_limited)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::window::WindowRecord;

    fn rid() -> RuleId {
        RuleId {
            namespace: "ns".into(),
            service: "svc".into(),
            rule_id: "r1".into(),
            revision: "1".into(),
        }
    }

    #[test]
    fn accumulates_across_multiple_records() {
        let recorder = Recorder::new();
        let rule_id = rid();
        recorder.record(
            &rule_id,
            &WindowRecord {
                per_duration: vec![(Duration::from_secs(1), 8, 2)],
                traffic_shaping_limited: 0,
            },
        );
        recorder.record(
            &rule_id,
            &WindowRecord {
                per_duration: vec![(Duration::from_secs(1), 5, 1)],
                traffic_shaping_limited: 3,
            },
        );

        let totals = recorder.totals_for(&rule_id);
        let (_, dim) = totals.iter().find(|(d, _)| *d == Duration::from_secs(1)).unwrap();
        assert_eq!(dim.pass, 13);
        assert_eq!(dim.limit, 3);
        assert_eq!(recorder.traffic_shaping_limited_for(&rule_id), 3);
    }
}
