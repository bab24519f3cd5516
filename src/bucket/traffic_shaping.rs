//! The traffic-shaping bucket sits in front of the token buckets and decides
//! admission shape: either a no-op (`Reject`, the token bucket is the sole
//! arbiter) or a uniform-rate queue that spaces admissions evenly.
//!
//! The reject variant is the identity ticket; the uniform-rate variant is a
//! CAS loop on `last_grant_time` so admission times are deterministic
//! rather than merely rate-shaped by the queue depth of a background
//! refill task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::model::{Action, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapingOutcome {
    /// Admitted immediately.
    Approved,
    /// Admitted, but the caller should wait this long before proceeding
    /// (uniform-rate queueing).
    ApprovedAfter(Duration),
    Declined,
}

const DEFAULT_MAX_QUEUEING: Duration = Duration::from_secs(1);

/// One traffic-shaping bucket per [`crate::window::RateLimitWindow`].
#[derive(Debug)]
pub enum TrafficShapingBucket {
    Reject,
    Unirate {
        /// Milliseconds between grants, derived from the lowest-qps amount.
        interval_ms: i64,
        max_queueing: Duration,
        /// Millisecond timestamp (relative to an arbitrary epoch) of the
        /// next slot to hand out; CAS'd forward on every admission.
        /// [`NO_GRANT_YET`] means no caller has been granted a slot yet.
        last_grant_time_ms: AtomicI64,
    },
}

/// Sentinel for "this bucket has never granted a slot".
const NO_GRANT_YET: i64 = i64::MIN;

impl TrafficShapingBucket {
    pub fn new(action: Action, amounts: &[Amount]) -> Self {
        match action {
            Action::Reject => TrafficShapingBucket::Reject,
            Action::Unirate => {
                // Any zero-qps amount means the bucket short-circuits to
                // admit-all: the token bucket for that amount will still
                // reject, preserving the contract that a zero-qps rule is
                // enforced there instead of here.
                if amounts.iter().any(|a| a.max_amount == 0) {
                    return TrafficShapingBucket::Reject;
                }
                // Pick the amount with the lowest qps (max_amount / duration),
                // ties broken by longest duration.
                let chosen = amounts.iter().max_by(|a, b| {
                    let qps_a = qps(a);
                    let qps_b = qps(b);
                    qps_b
                        .partial_cmp(&qps_a)
                        .unwrap()
                        .then(a.valid_duration.cmp(&b.valid_duration))
                });
                let Some(chosen) = chosen else {
                    return TrafficShapingBucket::Reject;
                };
                let interval_ms =
                    (chosen.valid_duration.as_millis() as i64) / chosen.max_amount.max(1);
                TrafficShapingBucket::Unirate {
                    interval_ms: interval_ms.max(1),
                    max_queueing: DEFAULT_MAX_QUEUEING,
                    last_grant_time_ms: AtomicI64::new(NO_GRANT_YET),
                }
            }
        }
    }

    /// `now_ms` is a monotonic millisecond clock shared by all callers of
    /// this bucket (e.g. since process start, or since the window's
    /// creation — any monotonic origin works, as only deltas matter).
    pub fn get_quota(&self, acquire_amount: i64, now_ms: i64) -> ShapingOutcome {
        match self {
            TrafficShapingBucket::Reject => ShapingOutcome::Approved,
            TrafficShapingBucket::Unirate {
                interval_ms,
                max_queueing,
                last_grant_time_ms,
            } => {
                let cost = interval_ms * acquire_amount.max(1);
                loop {
                    let last = last_grant_time_ms.load(Ordering::Acquire);
                    let expected = if last == NO_GRANT_YET {
                        now_ms
                    } else {
                        (last + cost).max(now_ms)
                    };
                    let wait = expected - now_ms;
                    if wait > max_queueing.as_millis() as i64 {
                        return ShapingOutcome::Declined;
                    }
                    if last_grant_time_ms
                        .compare_exchange(last, expected, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return if wait <= 0 {
                            ShapingOutcome::Approved
                        } else {
                            ShapingOutcome::ApprovedAfter(Duration::from_millis(wait as u64))
                        };
                    }
                }
            }
        }
    }
}

fn qps(a: &Amount) -> f64 {
    a.max_amount as f64 / a.valid_duration.as_secs_f64().max(f64::EPSILON)
}

#[cfg(test)]
mod test {
    use super::*;

    fn amount(max: i64, dur_ms: u64) -> Amount {
        Amount {
            max_amount: max,
            valid_duration: Duration::from_millis(dur_ms),
            precision: 100,
            start_amount: 0,
            end_amount: max,
            min_amount: 0,
        }
    }

    #[test]
    fn reject_always_admits() {
        let bucket = TrafficShapingBucket::new(Action::Reject, &[amount(1, 1000)]);
        for i in 0..1000 {
            assert_eq!(bucket.get_quota(1, i), ShapingOutcome::Approved);
        }
    }

    #[test]
    fn zero_qps_amount_short_circuits_to_admit_all() {
        let bucket = TrafficShapingBucket::new(Action::Unirate, &[amount(0, 1000)]);
        assert!(matches!(bucket.get_quota(1, 0), ShapingOutcome::Approved));
    }

    #[test]
    fn unirate_spaces_grants_by_duration_over_n() {
        // 20 per 2s => 100ms apart.
        let bucket = TrafficShapingBucket::new(Action::Unirate, &[amount(20, 2000)]);
        let mut admitted = 0;
        let mut last_wait = None;
        for i in 0..20 {
            match bucket.get_quota(1, 0) {
                ShapingOutcome::Approved => {
                    admitted += 1;
                    last_wait = Some(0i64);
                }
                ShapingOutcome::ApprovedAfter(d) => {
                    admitted += 1;
                    last_wait = Some(d.as_millis() as i64);
                }
                ShapingOutcome::Declined => {}
            }
            let _ = i;
        }
        // Requests 0..=10 fit within the 1s queueing budget (0,100,..,1000ms).
        assert_eq!(admitted, 11);
        assert_eq!(last_wait, Some(1000));
    }

    #[test]
    fn unirate_picks_lowest_qps_amount() {
        // (150, 10s) => 15 qps; (20, 2s) => 10 qps. Lower qps wins: 2s/20=100ms.
        let bucket = TrafficShapingBucket::new(
            Action::Unirate,
            &[amount(150, 10_000), amount(20, 2_000)],
        );
        match bucket {
            TrafficShapingBucket::Unirate { interval_ms, .. } => assert_eq!(interval_ms, 100),
            _ => panic!("expected unirate"),
        }
    }
}
