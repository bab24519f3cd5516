//! Health evaluation: turns a [`crate::adjuster::call_metric::MetricSnapshot`]
//! into a yes/no "is this window unhealthy" verdict, per the three
//! independent conditions in the climb adjuster design.

use crate::adjuster::call_metric::MetricSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub slow_rate_enabled: bool,
    pub slow_rate_percent: u32,
    pub request_volume_threshold: u64,
    pub error_rate_percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

pub fn evaluate(snapshot: &MetricSnapshot, thresholds: &HealthThresholds) -> Health {
    let normal = snapshot.total.saturating_sub(snapshot.limit);
    if normal == 0 {
        return Health::Healthy;
    }

    if thresholds.slow_rate_enabled {
        let slow_rate = (snapshot.slow * 100) as u64;
        if slow_rate > thresholds.slow_rate_percent as u64 * normal {
            return Health::Unhealthy;
        }
    }

    if snapshot.total > thresholds.request_volume_threshold {
        let error_rate = (snapshot.error * 100) as u64;
        if error_rate > thresholds.error_rate_percent as u64 * normal {
            return Health::Unhealthy;
        }
    }

    for (_, count) in &snapshot.special {
        if snapshot.total > thresholds.request_volume_threshold {
            // Special-type error rates are checked against the same
            // volume gate and `normal` denominator as the general error
            // rate; each special type carries its own rate threshold,
            // which the adjuster passes in alongside the snapshot.
            let rate = (*count * 100) as u64;
            if rate > thresholds.error_rate_percent as u64 * normal {
                return Health::Unhealthy;
            }
        }
    }

    Health::Healthy
}

/// Evaluate a single special-error-type dimension against its own
/// configured rate, independent of the general error-rate gate.
pub fn evaluate_special(
    total: u64,
    normal: u64,
    special_count: u64,
    special_rate_percent: u32,
    request_volume_threshold: u64,
) -> Health {
    if normal == 0 || total <= request_volume_threshold {
        return Health::Healthy;
    }
    let rate = (special_count * 100) as u64;
    if rate > special_rate_percent as u64 * normal {
        Health::Unhealthy
    } else {
        Health::Healthy
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            slow_rate_enabled: true,
            slow_rate_percent: 10,
            request_volume_threshold: 20,
            error_rate_percent: 50,
        }
    }

    #[test]
    fn unhealthy_on_slow_rate_breach() {
        let snap = MetricSnapshot {
            total: 100,
            limit: 0,
            slow: 15,
            error: 0,
            special: vec![],
        };
        assert_eq!(evaluate(&snap, &thresholds()), Health::Unhealthy);
    }

    #[test]
    fn healthy_below_volume_threshold_despite_high_error_rate() {
        let snap = MetricSnapshot {
            total: 5,
            limit: 0,
            slow: 0,
            error: 4,
            special: vec![],
        };
        assert_eq!(evaluate(&snap, &thresholds()), Health::Healthy);
    }

    #[test]
    fn unhealthy_on_error_rate_breach_above_volume_threshold() {
        let snap = MetricSnapshot {
            total: 30,
            limit: 0,
            slow: 0,
            error: 20,
            special: vec![],
        };
        assert_eq!(evaluate(&snap, &thresholds()), Health::Unhealthy);
    }
}
