//! One calendar window's token accounting.
//!
//! [`TokenBucket`] is the lock-free core described in the quota window spec:
//! local usage, remote residual quota, and pending-ack bookkeeping, all as
//! atomics so many tasks can call [`TokenBucket::get_token`] concurrently on
//! a single window without a mutex in the hot path.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::model::Amount;

/// Sentinel returned by [`TokenBucket::refresh_token`] meaning "no
/// speed-up needed, report at the normal cadence".
pub const NO_SPEEDUP: u64 = u64::MAX;

/// Result of [`TokenBucket::get_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGrant {
    pub allowed: bool,
    pub left_quota: i64,
}

/// Snapshot of usage since the last report, handed to the connector for
/// serialisation and captured as part of a `QuotaUsageInfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaUsage {
    pub allocated: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct RemoteQuotaInfo {
    /// Remote token total, not itself decremented on allocation.
    remote_total: AtomicI64,
    /// Remote tokens left, decremented on every remote-backed allocation.
    remote_left: AtomicI64,
    /// Accumulated allocated-and-synced-eligible quota since the last report.
    quota_need_sync: AtomicU64,
    /// Accumulated locally-rejected count since the last report.
    limit_request: AtomicU64,
}

/// One `Amount`'s worth of accounting inside a [`crate::window::RateLimitWindow`].
#[derive(Debug)]
pub struct TokenBucket {
    valid_duration: Duration,
    /// Budget used when operating from local fallback (LOCAL rules, or a
    /// GLOBAL rule with stale/absent remote quota).
    local_max_amount: AtomicI64,
    bucket_time: AtomicU64,
    bucket_stat: AtomicI64,
    /// Bucket time for which a report is outstanding; `u64::MAX` = none.
    pending_bucket_time: AtomicU64,
    pending_bucket_stat: AtomicI64,
    remote: RemoteQuotaInfo,
}

const NO_PENDING: u64 = u64::MAX;

impl TokenBucket {
    pub fn new(amount: &Amount, local_max_amount: i64, now: Duration) -> Self {
        let bucket_time = bucket_time_for(now, amount.valid_duration);
        Self {
            valid_duration: amount.valid_duration,
            local_max_amount: AtomicI64::new(local_max_amount),
            bucket_time: AtomicU64::new(bucket_time),
            bucket_stat: AtomicI64::new(0),
            pending_bucket_time: AtomicU64::new(NO_PENDING),
            pending_bucket_stat: AtomicI64::new(0),
            remote: RemoteQuotaInfo {
                remote_total: AtomicI64::new(local_max_amount),
                remote_left: AtomicI64::new(local_max_amount),
                quota_need_sync: AtomicU64::new(0),
                limit_request: AtomicU64::new(0),
            },
        }
    }

    pub fn valid_duration(&self) -> Duration {
        self.valid_duration
    }

    pub fn update_local_max_amount(&self, local_max_amount: i64) {
        self.local_max_amount.store(local_max_amount, Ordering::Relaxed);
    }

    pub fn local_max_amount(&self) -> i64 {
        self.local_max_amount.load(Ordering::Relaxed)
    }

    pub fn expect_bucket_time(&self, now: Duration) -> u64 {
        bucket_time_for(now, self.valid_duration)
    }

    /// Roll the bucket forward to `expect_bucket_time` if it differs from
    /// the stored value, resetting all per-window counters exactly once
    /// across all concurrent callers via a CAS.
    fn roll_if_needed(&self, expect_bucket_time: u64) {
        let current = self.bucket_time.load(Ordering::Acquire);
        if current == expect_bucket_time {
            return;
        }
        if self
            .bucket_time
            .compare_exchange(current, expect_bucket_time, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let local_max = self.local_max_amount.load(Ordering::Relaxed);
            self.bucket_stat.store(0, Ordering::Release);
            self.pending_bucket_stat.store(0, Ordering::Release);
            self.remote.remote_total.store(local_max, Ordering::Release);
            self.remote.remote_left.store(local_max, Ordering::Release);
            self.remote.quota_need_sync.store(0, Ordering::Release);
        }
        // Losing the CAS means another caller already rolled it — proceed.
    }

    pub fn get_token(&self, amount: i64, expect_bucket_time: u64, use_remote: bool) -> TokenGrant {
        self.roll_if_needed(expect_bucket_time);

        let used = self.bucket_stat.fetch_add(amount, Ordering::AcqRel) + amount;

        if use_remote {
            let left = self.remote.remote_left.fetch_add(-amount, Ordering::AcqRel) - amount;
            if left < 0 {
                self.remote
                    .limit_request
                    .fetch_add(amount as u64, Ordering::AcqRel);
                TokenGrant {
                    allowed: false,
                    left_quota: left,
                }
            } else {
                self.remote
                    .quota_need_sync
                    .fetch_add(amount as u64, Ordering::AcqRel);
                TokenGrant {
                    allowed: true,
                    left_quota: left,
                }
            }
        } else {
            let local_max = self.local_max_amount.load(Ordering::Relaxed);
            let left = local_max - used;
            TokenGrant {
                allowed: left >= 0,
                left_quota: left,
            }
        }
    }

    /// Undo the effect of a [`TokenBucket::get_token`] call whose result was
    /// discarded because a *later* bucket in the same `Allocate` rejected
    /// the request.
    pub fn return_token(&self, amount: i64, use_remote: bool) {
        self.bucket_stat.fetch_add(-amount, Ordering::AcqRel);
        if use_remote {
            self.remote.remote_left.fetch_add(amount, Ordering::AcqRel);
            // quota_need_sync intentionally is not unwound: it only tracks
            // quota that would still need reporting if it *had* gone
            // through, and reporting a slightly stale number here is
            // harmless — the next report's ack arithmetic self-corrects.
        }
    }

    /// Apply a fresh remote quota snapshot. Returns either a requested
    /// earlier-report delay (speed-up), or [`NO_SPEEDUP`].
    pub fn refresh_token(
        &self,
        remote_left: i64,
        ack_quota: u64,
        current_bucket_time: u64,
        remote_expired: bool,
        current_time_in_window: Duration,
    ) -> u64 {
        let last_total = self.remote.remote_total.swap(remote_left, Ordering::AcqRel);

        let new_left = if remote_expired {
            remote_left
        } else {
            loop {
                let current_left = self.remote.remote_left.load(Ordering::Acquire);
                let used_while_in_flight =
                    (last_total - current_left - ack_quota as i64).max(0);
                let candidate = remote_left - used_while_in_flight;
                if self
                    .remote
                    .remote_left
                    .compare_exchange(
                        current_left,
                        candidate,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    break candidate;
                }
            }
        };
        if remote_expired {
            self.remote.remote_left.store(new_left, Ordering::Release);
        }

        let bucket_time = self.bucket_time.load(Ordering::Acquire);
        if bucket_time == current_bucket_time {
            self.pending_bucket_stat
                .fetch_sub(ack_quota as i64, Ordering::AcqRel);
        } else {
            self.pending_bucket_stat.store(0, Ordering::Release);
        }

        let used = self.bucket_stat.load(Ordering::Acquire).max(1);
        if remote_left > 0 {
            let elapsed_ms = current_time_in_window.as_millis().max(1) as i64;
            let left_time_ms = (new_left * elapsed_ms) / used;
            if left_time_ms < 80 {
                return (left_time_ms / 2 + 1).max(0) as u64;
            }
        }
        NO_SPEEDUP
    }

    /// Atomically drain `quota_need_sync`/`limit_request` into a
    /// [`QuotaUsage`] snapshot for reporting, and roll it into
    /// `pending_bucket_stat` for the given `bucket_time`.
    pub fn prepare_pending_quota(&self, bucket_time: u64) -> QuotaUsage {
        let allocated = self.remote.quota_need_sync.swap(0, Ordering::AcqRel);
        let rejected = self.remote.limit_request.swap(0, Ordering::AcqRel);

        let pending_time = self.pending_bucket_time.load(Ordering::Acquire);
        if pending_time == bucket_time {
            self.pending_bucket_stat
                .fetch_add(allocated as i64, Ordering::AcqRel);
        } else {
            self.pending_bucket_time.store(bucket_time, Ordering::Release);
            self.pending_bucket_stat.store(allocated as i64, Ordering::Release);
        }

        QuotaUsage { allocated, rejected }
    }
}

fn bucket_time_for(now: Duration, valid_duration: Duration) -> u64 {
    let now_ms = now.as_millis() as u64;
    let dur_ms = valid_duration.as_millis().max(1) as u64;
    now_ms / dur_ms
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

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
    fn local_bucket_admits_exactly_n_per_window() {
        let a = amount(10, 1000);
        let bucket = TokenBucket::new(&a, 10, Duration::from_millis(0));
        let mut ok = 0;
        for _ in 0..20 {
            let bt = bucket.expect_bucket_time(Duration::from_millis(0));
            if bucket.get_token(1, bt, false).allowed {
                ok += 1;
            }
        }
        assert_eq!(ok, 10);

        // Crossing into the next window resets the budget exactly once.
        let mut ok2 = 0;
        for _ in 0..20 {
            let bt = bucket.expect_bucket_time(Duration::from_millis(1000));
            if bucket.get_token(1, bt, false).allowed {
                ok2 += 1;
            }
        }
        assert_eq!(ok2, 10);
    }

    #[test]
    fn return_token_undoes_local_allocation() {
        let a = amount(5, 1000);
        let bucket = TokenBucket::new(&a, 5, Duration::ZERO);
        let bt = bucket.expect_bucket_time(Duration::ZERO);
        for _ in 0..5 {
            assert!(bucket.get_token(1, bt, false).allowed);
        }
        assert!(!bucket.get_token(1, bt, false).allowed);
        bucket.return_token(1, false);
        assert!(bucket.get_token(1, bt, false).allowed);
    }

    #[test]
    fn ack_arithmetic_matches_spec_formula() {
        let a = amount(100, 2000);
        let bucket = TokenBucket::new(&a, 100, Duration::ZERO);
        let bt = bucket.expect_bucket_time(Duration::ZERO);
        // previousTotal=100, previousLeft after using 7 remote tokens = 93
        for _ in 0..7 {
            bucket.get_token(1, bt, true);
        }
        let usage = bucket.prepare_pending_quota(bt);
        assert_eq!(usage.allocated, 7);

        // Response says remoteLeft=4 with ack=A=7 (all of it acked).
        bucket.refresh_token(4, 7, bt, false, Duration::from_millis(100));
        let post_left = bucket.remote.remote_left.load(Ordering::Acquire);
        // previousTotal - previousLeft - ack = 100 - 93 - 7 = 0 -> newLeft = 4 - 0 = 4
        assert_eq!(post_left, 4);
    }

    #[test]
    fn concurrent_allocate_rolls_bucket_exactly_once() {
        let a = amount(1000, 50);
        let bucket = Arc::new(TokenBucket::new(&a, 1000, Duration::ZERO));
        let bt = bucket.expect_bucket_time(Duration::from_millis(60));
        let mut handles = vec![];
        for _ in 0..8 {
            let bucket = bucket.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    bucket.get_token(1, bt, false);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let stat = bucket.bucket_stat.load(Ordering::Acquire);
        assert_eq!(stat, 400);
    }
}
