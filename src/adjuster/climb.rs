//! The climb adjuster: periodically evaluates a window's call-metric health
//! and tunes its primary [`crate::model::Amount::max_amount`] up or down
//! under the finite-state policy from the component design.
//!
//! Attaches to a window only when `rule.adjuster` is `Some` and
//! `config.enable` is set. Tunes exactly one dimension — the window's
//! fastest (shortest-duration) amount, which is the one traffic-shaping and
//! token-bucket admission are actually gated on for QPS rules.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::adjuster::call_metric::{CallMetricRing, CallResultType, SpecialErrorType};
use crate::adjuster::health::{evaluate, Health, HealthThresholds};
use crate::model::RuleId;

/// Climb-adjuster configuration, parsed from a rule's `Adjuster` field.
#[derive(Debug, Clone, PartialEq)]
pub struct ClimbConfig {
    pub enable: bool,
    pub window_size: Duration,
    pub precision: usize,
    pub judge_interval: Duration,
    pub slow_max_rt: Duration,
    pub slow_rate_enabled: bool,
    pub slow_rate_percent: u32,
    pub request_volume_threshold: u64,
    pub error_rate_percent: u32,
    pub specials: Vec<SpecialErrorType>,
    pub tune_down_period: u32,
    pub tune_up_period: u32,
    /// Percent (e.g. 95 = ×0.95) applied below the soft floor on tune-down.
    pub cold_below_tune_down_rate_percent: u32,
    /// Percent applied above the soft floor on tune-down.
    pub cold_above_tune_down_rate_percent: u32,
    /// Percent divisor (`oldMax * 100 / rate`) applied below the soft floor
    /// on tune-up.
    pub cold_below_tune_up_rate_percent: u32,
    /// Percent divisor applied above the soft floor on tune-up.
    pub cold_above_tune_up_rate_percent: u32,
    pub limit_threshold_to_tune_up_percent: u32,
}

impl Default for ClimbConfig {
    fn default() -> Self {
        Self {
            enable: false,
            window_size: Duration::from_secs(60),
            precision: 100,
            judge_interval: Duration::from_secs(10),
            slow_max_rt: Duration::from_millis(500),
            slow_rate_enabled: true,
            slow_rate_percent: 10,
            request_volume_threshold: 20,
            error_rate_percent: 50,
            specials: Vec::new(),
            tune_down_period: 2,
            tune_up_period: 5,
            cold_below_tune_down_rate_percent: 95,
            cold_above_tune_down_rate_percent: 95,
            cold_below_tune_up_rate_percent: 80,
            cold_above_tune_up_rate_percent: 90,
            limit_threshold_to_tune_up_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TuneState {
    Keeping,
    TuningUp,
    TuningDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneReason {
    Unhealthy,
    HealthyWithLimits,
}

/// A recorded threshold change, drained by `CollectRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdChange {
    pub time_ms: i64,
    pub old_threshold: i64,
    pub new_threshold: i64,
    pub reason: TuneReason,
}

const CHANGE_LOG_CAP: usize = 64;

pub struct ClimbAdjuster {
    config: ClimbConfig,
    metric: CallMetricRing,
    current_max: AtomicI64,
    start_amount: i64,
    end_amount: i64,
    min_amount: i64,
    state: Mutex<TuneState>,
    down_counter: AtomicU32,
    up_trigger_counter: AtomicU32,
    changes: Mutex<Vec<ThresholdChange>>,
}

impl ClimbAdjuster {
    pub fn new(
        rule_id: RuleId,
        config: ClimbConfig,
        initial_max: i64,
        start_amount: i64,
        end_amount: i64,
        min_amount: i64,
    ) -> Self {
        let metric = CallMetricRing::new(
            rule_id,
            config.window_size,
            config.precision,
            config.slow_max_rt,
            config.slow_rate_enabled,
            config.specials.clone(),
        );
        Self {
            config,
            metric,
            current_max: AtomicI64::new(initial_max),
            start_amount,
            end_amount,
            min_amount,
            state: Mutex::new(TuneState::Keeping),
            down_counter: AtomicU32::new(0),
            up_trigger_counter: AtomicU32::new(0),
            changes: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, now_ms: u64, result: CallResultType, response_time_ms: u64, response_code: i32) {
        self.metric.record(now_ms, result, response_time_ms, response_code);
    }

    pub fn current_max(&self) -> i64 {
        self.current_max.load(Ordering::Relaxed)
    }

    fn below_soft_floor(&self, max: i64) -> bool {
        max <= self.start_amount
    }

    fn push_change(&self, now_ms: i64, old: i64, new: i64, reason: TuneReason) {
        let mut log = self.changes.lock();
        if log.len() >= CHANGE_LOG_CAP {
            log.remove(0);
        }
        log.push(ThresholdChange {
            time_ms: now_ms,
            old_threshold: old,
            new_threshold: new,
            reason,
        });
    }

    /// Drain the threshold-change log, returning whatever accumulated since
    /// the last call.
    pub fn drain_changes(&self) -> Vec<ThresholdChange> {
        std::mem::take(&mut self.changes.lock())
    }

    /// Run one judge cycle. Returns the (possibly unchanged) new max, and
    /// `true` if it actually changed `current_max`.
    pub fn judge(&self, now_ms: i64) -> (i64, bool) {
        let snapshot = self.metric.snapshot();
        self.metric.clear();

        let thresholds = HealthThresholds {
            slow_rate_enabled: self.config.slow_rate_enabled,
            slow_rate_percent: self.config.slow_rate_percent,
            request_volume_threshold: self.config.request_volume_threshold,
            error_rate_percent: self.config.error_rate_percent,
        };
        let health = evaluate(&snapshot, &thresholds);
        let old_max = self.current_max.load(Ordering::Relaxed);

        let mut state = self.state.lock();
        let (new_max, changed) = match health {
            Health::Unhealthy => {
                *state = TuneState::TuningDown;
                self.down_counter.fetch_add(1, Ordering::Relaxed);
                self.up_trigger_counter.store(0, Ordering::Relaxed);

                if self.below_soft_floor(old_max) {
                    let candidate = scale_down(old_max, self.config.cold_below_tune_down_rate_percent)
                        .max(self.min_amount);
                    (candidate, candidate != old_max)
                } else {
                    let count = self.down_counter.load(Ordering::Relaxed);
                    if count >= self.config.tune_down_period {
                        self.down_counter.store(0, Ordering::Relaxed);
                        let candidate =
                            scale_down(old_max, self.config.cold_above_tune_down_rate_percent)
                                .max(self.start_amount);
                        (candidate, candidate != old_max)
                    } else {
                        (old_max, false)
                    }
                }
            }
            Health::Healthy if snapshot.limit > 0 => {
                *state = TuneState::TuningUp;
                self.down_counter.store(0, Ordering::Relaxed);

                if self.below_soft_floor(old_max) {
                    let candidate =
                        scale_up(old_max, self.config.cold_below_tune_up_rate_percent)
                            .min(self.start_amount);
                    (candidate, candidate != old_max)
                } else {
                    let trigger = (snapshot.limit as i128 * 100)
                        > (snapshot.total as i128 * self.config.limit_threshold_to_tune_up_percent as i128);
                    if trigger {
                        let count = self.up_trigger_counter.fetch_add(1, Ordering::Relaxed) + 1;
                        if count >= self.config.tune_up_period {
                            self.up_trigger_counter.store(0, Ordering::Relaxed);
                            let candidate =
                                scale_up(old_max, self.config.cold_above_tune_up_rate_percent)
                                    .min(self.end_amount);
                            (candidate, candidate != old_max)
                        } else {
                            (old_max, false)
                        }
                    } else {
                        (old_max, false)
                    }
                }
            }
            Health::Healthy => {
                *state = TuneState::Keeping;
                self.down_counter.store(0, Ordering::Relaxed);
                self.up_trigger_counter.store(0, Ordering::Relaxed);
                (old_max, false)
            }
        };
        drop(state);

        if changed {
            self.current_max.store(new_max, Ordering::Relaxed);
            let reason = if new_max < old_max {
                TuneReason::Unhealthy
            } else {
                TuneReason::HealthyWithLimits
            };
            self.push_change(now_ms, old_max, new_max, reason);
            tracing::debug!(
                rule_id = ?self.metric.rule_id(),
                old_max,
                new_max,
                "climb adjuster changed threshold",
            );
        }

        (new_max, changed)
    }
}

fn scale_down(max: i64, rate_percent: u32) -> i64 {
    (max * rate_percent as i64) / 100
}

fn scale_up(max: i64, divisor_percent: u32) -> i64 {
    // Ceiling division: newMax = ceil(oldMax * 100 / divisorPercent).
    let numerator = max * 100;
    let denom = divisor_percent.max(1) as i64;
    (numerator + denom - 1) / denom
}

#[cfg(test)]
mod test {
    use super::*;

    fn rid() -> RuleId {
        RuleId {
            namespace: "ns".into(),
            service: "svc".into(),
            rule_id: "r1".into(),
            revision: "1".into(),
        }
    }

    fn adjuster(initial_max: i64, start: i64, end: i64, min: i64) -> ClimbAdjuster {
        ClimbAdjuster::new(rid(), ClimbConfig::default(), initial_max, start, end, min)
    }

    #[test]
    fn tune_down_stops_at_soft_floor() {
        let a = adjuster(90, 70, 100, 0);
        a.metric.record(0, CallResultType::Ok, 600, 200);
        a.metric.record(0, CallResultType::Ok, 600, 200);

        // Cycle 1: breach, below tune_down_period (2) -> no change yet.
        let (max1, changed1) = a.judge(10_000);
        assert_eq!(max1, 90);
        assert!(!changed1);

        for _ in 0..2 {
            a.metric.record(0, CallResultType::Ok, 600, 200);
            a.metric.record(0, CallResultType::Ok, 600, 200);
        }
        // Cycle 2: second consecutive breach -> acts.
        let (max2, changed2) = a.judge(20_000);
        assert!(changed2);
        assert_eq!(max2, 85); // 90 * 95% = 85

        // Keep breaching every cycle (tune_down_period=2) until floor.
        let mut current = max2;
        for i in 0..10 {
            for _ in 0..2 {
                a.metric.record(0, CallResultType::Ok, 600, 200);
                a.metric.record(0, CallResultType::Ok, 600, 200);
            }
            a.judge(30_000 + i * 10_000);
            current = a.current_max();
            if current <= 70 {
                break;
            }
        }
        assert_eq!(current, 70);
    }

    #[test]
    fn tune_up_below_floor_matches_spec_sequence() {
        let a = adjuster(10, 70, 1000, 0);
        // Healthy with limit_count > 0 drives tune-up every cycle while below floor.
        let expect = [16, 25, 39, 60, 70];
        let mut now = 0i64;
        for want in expect {
            a.metric.record(0, CallResultType::Ok, 10, 200);
            a.metric.record(0, CallResultType::Limited, 0, 0);
            now += 10_000;
            let (max, changed) = a.judge(now);
            assert!(changed);
            assert_eq!(max, want);
        }
    }

    #[test]
    fn never_exceeds_end_amount_or_drops_below_min_amount() {
        let a = adjuster(95, 70, 100, 50);
        for i in 0..20 {
            a.metric.record(0, CallResultType::Ok, 10, 200);
            a.metric.record(0, CallResultType::Limited, 0, 0);
            a.judge(i * 10_000);
            assert!(a.current_max() <= 100);
        }

        let b = adjuster(90, 70, 100, 50);
        for i in 0..20 {
            b.metric.record(0, CallResultType::Ok, 600, 200);
            b.metric.record(0, CallResultType::Ok, 600, 200);
            b.judge(i * 10_000);
            assert!(b.current_max() >= 50);
        }
    }
}
