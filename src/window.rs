//! The per-`(rule, label-subset)` window: the state machine that owns one
//! traffic-shaping bucket and one token bucket per [`crate::model::Amount`],
//! and the `Allocate` decision path that ties them together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::adjuster::climb::ClimbAdjuster;
use crate::adjuster::call_metric::CallResultType;
use crate::bucket::{ShapingOutcome, TokenBucket, TrafficShapingBucket};
use crate::model::{Action, AmountMode, FailoverType, RateLimitRule, RateLimitWindowKey, RuleType};

/// Lifecycle state of a [`RateLimitWindow`]. `Expired` is a soft state:
/// `Allocate` keeps working in fallback, only [`AllocateOutcome::is_degrade`]
/// flips — eviction is driven by `is_deleted`/expiry time, not this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Created,
    Connecting,
    Syncing,
    Expired,
    Ready,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateResult {
    Ok,
    Limited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocateOutcome {
    pub result: AllocateResult,
    pub left_quota: i64,
    pub all_quota: i64,
    pub duration: Duration,
    pub is_degrade: bool,
    pub wait: Duration,
}

#[derive(Debug, Default)]
struct DurationRecord {
    pass_count: AtomicU64,
    limit_count: AtomicU64,
}

/// Per-window telemetry, drained by [`RateLimitWindow::collect_record`].
#[derive(Debug, Clone, Default)]
pub struct WindowRecord {
    pub per_duration: Vec<(Duration, u64, u64)>,
    pub traffic_shaping_limited: u64,
}

struct AmountBucket {
    duration: Duration,
    bucket: TokenBucket,
    record: DurationRecord,
}

/// One monotonic clock origin shared by a window's traffic-shaping bucket
/// and expiry tracking. Exposed so tests can drive fake time; production
/// callers pass wall-clock milliseconds from `SystemTime::now()`.
pub type Millis = i64;

pub struct RateLimitWindow {
    pub key: RateLimitWindowKey,
    pub rule: Arc<RateLimitRule>,
    traffic_shaping: TrafficShapingBucket,
    amounts: Vec<AmountBucket>,
    local_max_amount: i64,
    /// Estimated `server_time - wall_clock`, maintained by the connector.
    time_diff_ms: AtomicI64,
    /// Wall-clock time (ms) of the last successful remote sync.
    last_sync_ms: AtomicI64,
    min_duration_ms: i64,
    state: Mutex<WindowState>,
    connection_id: AtomicU64,
    counter_keys: Mutex<HashMap<u64, u32>>,
    is_deleted: AtomicBool,
    last_use_ms: AtomicI64,
    traffic_shaping_limited: AtomicU64,
    init_notify: Notify,
    pub adjuster: Option<ClimbAdjuster>,
}

impl RateLimitWindow {
    pub fn new(
        rule: Arc<RateLimitRule>,
        key: RateLimitWindowKey,
        local_max_amount: i64,
        now_ms: Millis,
    ) -> Self {
        let sorted = rule.amounts_by_duration();
        let min_duration_ms = sorted
            .first()
            .map(|a| a.valid_duration.as_millis() as i64)
            .unwrap_or(1000);
        // `local_max_amount` is the resolved fallback budget for the
        // *primary* (shortest-duration) amount, already adjusted by the
        // manager for `AmountMode::ShareEqually`. Other amounts in the same
        // rule scale their own fallback proportionally to their configured
        // `max_amount`, so a rule like `(150, 10s) + (20, 2s)` keeps both
        // buckets' relative budgets instead of all sharing one number.
        let primary_max = sorted.first().map(|a| a.max_amount.max(1)).unwrap_or(1);
        let amounts = sorted
            .iter()
            .map(|a| {
                let bucket_local_max = if a.max_amount == 0 {
                    0
                } else {
                    ((local_max_amount as i128 * a.max_amount as i128) / primary_max as i128) as i64
                };
                AmountBucket {
                    duration: a.valid_duration,
                    bucket: TokenBucket::new(a, bucket_local_max, Duration::from_millis(now_ms.max(0) as u64)),
                    record: DurationRecord::default(),
                }
            })
            .collect();
        let traffic_shaping = TrafficShapingBucket::new(rule.action, &rule.amounts);

        let initial_state = match rule.rule_type {
            RuleType::Local => WindowState::Ready,
            RuleType::Global => WindowState::Created,
        };

        // The climb adjuster tunes the primary (shortest-duration) amount
        // only, so it is seeded from that amount's own soft-floor/ceiling
        // and the local max already resolved for it (`bucket_local_max`
        // above reduces to `local_max_amount` unscaled for the primary
        // amount, since its ratio to itself is 1).
        let adjuster = match (&rule.adjuster, sorted.first()) {
            (Some(cfg), Some(primary)) if cfg.enable => Some(ClimbAdjuster::new(
                rule.id.clone(),
                cfg.clone(),
                local_max_amount,
                primary.start_amount,
                primary.end_amount,
                primary.min_amount,
            )),
            _ => None,
        };

        Self {
            key,
            rule,
            traffic_shaping,
            amounts,
            local_max_amount,
            time_diff_ms: AtomicI64::new(0),
            last_sync_ms: AtomicI64::new(0),
            min_duration_ms,
            state: Mutex::new(initial_state),
            connection_id: AtomicU64::new(0),
            counter_keys: Mutex::new(HashMap::new()),
            is_deleted: AtomicBool::new(false),
            last_use_ms: AtomicI64::new(now_ms),
            traffic_shaping_limited: AtomicU64::new(0),
            init_notify: Notify::new(),
            adjuster,
        }
    }

    pub fn state(&self) -> WindowState {
        *self.state.lock()
    }

    fn set_state(&self, new_state: WindowState) {
        *self.state.lock() = new_state;
    }

    /// `ServerTime() = wallClock + timeDiff`.
    pub fn server_time_ms(&self, wall_clock_ms: Millis) -> Millis {
        wall_clock_ms + self.time_diff_ms.load(Ordering::Relaxed)
    }

    /// Called by the connector on every successful init/report/time-adjust.
    pub fn note_sync(&self, wall_clock_ms: Millis, time_diff_ms: i64) {
        let prior = self.time_diff_ms.swap(time_diff_ms, Ordering::Relaxed);
        if (time_diff_ms - prior).unsigned_abs() as i64 > self.min_duration_ms {
            tracing::warn!(
                rule_id = ?self.rule.id,
                prior_diff_ms = prior,
                new_diff_ms = time_diff_ms,
                "server time diff jumped by more than one window; applying immediately",
            );
        }
        self.last_sync_ms.store(wall_clock_ms, Ordering::Relaxed);
        let was_uninit = !matches!(
            *self.state.lock(),
            WindowState::Syncing | WindowState::Ready | WindowState::Expired
        );
        self.set_state(WindowState::Syncing);
        if was_uninit {
            self.init_notify.notify_waiters();
        }
    }

    pub fn set_connecting(&self) {
        if matches!(self.rule.rule_type, RuleType::Global) {
            self.set_state(WindowState::Connecting);
        }
    }

    pub fn mark_expired(&self) {
        if matches!(*self.state.lock(), WindowState::Syncing) {
            self.set_state(WindowState::Expired);
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::Relaxed)
    }

    /// Switching connections invalidates the window's counter-key map:
    /// server-assigned keys are not portable across sessions.
    pub fn set_connection_id(&self, id: u64) {
        let prior = self.connection_id.swap(id, Ordering::AcqRel);
        if prior != id {
            self.counter_keys.lock().clear();
        }
    }

    pub fn install_counter_key(&self, duration_ms: u64, counter_key: u32) {
        self.counter_keys.lock().insert(duration_ms, counter_key);
    }

    pub fn counter_key_for(&self, duration_ms: u64) -> Option<u32> {
        self.counter_keys.lock().get(&duration_ms).copied()
    }

    pub fn token_bucket_for_counter_key(&self, counter_key: u32) -> Option<&TokenBucket> {
        let duration_ms = {
            let map = self.counter_keys.lock();
            map.iter()
                .find(|(_, v)| **v == counter_key)
                .map(|(k, _)| *k)?
        };
        self.amounts
            .iter()
            .find(|a| a.duration.as_millis() as u64 == duration_ms)
            .map(|a| &a.bucket)
    }

    pub fn amounts(&self) -> impl Iterator<Item = (Duration, &TokenBucket)> {
        self.amounts.iter().map(|a| (a.duration, &a.bucket))
    }

    /// Applies a server-reported replica count from an init response.
    /// `ShareEqually` rules divide each amount's configured budget evenly
    /// across the known replicas; `GlobalTotal` rules already use the full
    /// configured amount as their local fallback regardless of replica
    /// count, so this is a no-op for them.
    pub fn apply_client_count(&self, client_count: u32) {
        if !matches!(self.rule.amount_mode, AmountMode::ShareEqually) {
            return;
        }
        let divisor = client_count.max(1) as i64;
        for amount in &self.amounts {
            let configured = self
                .rule
                .amounts
                .iter()
                .find(|a| a.valid_duration == amount.duration)
                .map(|a| a.max_amount)
                .unwrap_or(0);
            amount.bucket.update_local_max_amount(configured / divisor);
        }
    }

    /// `UpdateCallResult` — feeds one completed call into the climb
    /// adjuster's metric ring. A no-op when the window has no adjuster.
    pub fn record_call(&self, now_ms: u64, result: CallResultType, response_time_ms: u64, response_code: i32) {
        if let Some(adjuster) = &self.adjuster {
            adjuster.record(now_ms, result, response_time_ms, response_code);
        }
    }

    /// Runs one climb judge cycle and, if the threshold changed, pushes the
    /// new max into the primary (shortest-duration) amount's token bucket —
    /// the only dimension the climb adjuster tunes.
    pub fn run_climb_judge(&self, now_ms: Millis) {
        if let Some(adjuster) = &self.adjuster {
            let (new_max, changed) = adjuster.judge(now_ms);
            if changed {
                if let Some(primary) = self.amounts.first() {
                    primary.bucket.update_local_max_amount(new_max);
                }
            }
        }
    }

    /// Blocks (async) until the first successful init response arrives or
    /// `timeout` elapses. LOCAL rules are ready immediately. Returning
    /// `false` (timeout) is informational only — the data plane prefers
    /// availability and `allocate` continues to work in fallback.
    pub async fn wait_remote_init(&self, timeout: Duration) -> bool {
        if matches!(self.rule.rule_type, RuleType::Local) {
            return true;
        }
        if !matches!(self.state(), WindowState::Created | WindowState::Connecting) {
            return true;
        }
        let notified = self.init_notify.notified();
        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    /// `GetQuota` -> traffic shaping -> token buckets, shortest-duration
    /// bucket first, rolling back earlier successes on the first failure.
    pub fn allocate(&self, acquire: i64, wall_clock_ms: Millis) -> AllocateOutcome {
        self.last_use_ms.store(wall_clock_ms, Ordering::Relaxed);

        let shape = self.traffic_shaping.get_quota(acquire, wall_clock_ms);
        let wait = match shape {
            ShapingOutcome::Approved => Duration::ZERO,
            ShapingOutcome::ApprovedAfter(d) => d,
            ShapingOutcome::Declined => {
                self.traffic_shaping_limited.fetch_add(1, Ordering::Relaxed);
                return AllocateOutcome {
                    result: AllocateResult::Limited,
                    left_quota: 0,
                    all_quota: 0,
                    duration: Duration::ZERO,
                    is_degrade: false,
                    wait: Duration::ZERO,
                };
            }
        };

        let now = self.server_time_ms(wall_clock_ms);
        let remote_valid = matches!(self.rule.rule_type, RuleType::Global)
            && now < self.last_sync_ms.load(Ordering::Relaxed) + self.min_duration_ms;
        let is_degrade = !remote_valid;

        let mut granted: Vec<&AmountBucket> = Vec::with_capacity(self.amounts.len());
        for amount in &self.amounts {
            let expect_bt = amount
                .bucket
                .expect_bucket_time(Duration::from_millis(now.max(0) as u64));
            let grant = amount.bucket.get_token(acquire, expect_bt, remote_valid);
            if grant.allowed {
                granted.push(amount);
                continue;
            }

            // Roll back every earlier bucket in this allocate.
            for earlier in &granted {
                earlier.bucket.return_token(acquire, remote_valid);
            }
            amount.record.limit_count.fetch_add(1, Ordering::Relaxed);

            if is_degrade && matches!(self.rule.failover, FailoverType::FailoverPass) {
                return AllocateOutcome {
                    result: AllocateResult::Ok,
                    left_quota: grant.left_quota,
                    all_quota: self.local_max_amount,
                    duration: amount.duration,
                    is_degrade,
                    wait,
                };
            }
            return AllocateOutcome {
                result: AllocateResult::Limited,
                left_quota: grant.left_quota,
                all_quota: self.local_max_amount,
                duration: amount.duration,
                is_degrade,
                wait,
            };
        }

        for amount in &granted {
            amount.record.pass_count.fetch_add(1, Ordering::Relaxed);
        }
        let (last_duration, last_left) = self
            .amounts
            .last()
            .map(|a| {
                let bt = a.bucket.expect_bucket_time(Duration::from_millis(now.max(0) as u64));
                (a.duration, a.bucket.get_token(0, bt, remote_valid).left_quota)
            })
            .unwrap_or((Duration::ZERO, 0));

        AllocateOutcome {
            result: AllocateResult::Ok,
            left_quota: last_left,
            all_quota: self.local_max_amount,
            duration: last_duration,
            is_degrade,
            wait,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted.load(Ordering::Relaxed)
    }

    /// Idempotent: a second call is a no-op, matching the "double-calling
    /// `MakeDeleted` on a window is a no-op" invariant.
    pub fn make_deleted(&self) -> bool {
        let was = self.is_deleted.swap(true, Ordering::AcqRel);
        if !was {
            self.set_state(WindowState::Deleted);
        }
        !was
    }

    /// `lastUseMonotonic + expireTime < now`, where `expireTime = clamp(maxDuration * 3, 10s, 60s)`
    /// (LOCAL rules use the raw max duration, skipping the 60s ceiling).
    pub fn is_expired(&self, now_ms: Millis) -> bool {
        let max_duration = self
            .amounts
            .iter()
            .map(|a| a.duration)
            .max()
            .unwrap_or(Duration::from_secs(1));
        let expire = match self.rule.rule_type {
            RuleType::Local => max_duration,
            RuleType::Global => {
                let tripled = max_duration * 3;
                tripled.clamp(Duration::from_secs(10), Duration::from_secs(60))
            }
        };
        let last_use = self.last_use_ms.load(Ordering::Relaxed);
        last_use + expire.as_millis() as i64 < now_ms
    }

    /// Atomically drain per-duration pass/limit counts plus the
    /// traffic-shaping reject count. Returns `None` if every counter was
    /// zero (nothing worth reporting).
    pub fn collect_record(&self) -> Option<WindowRecord> {
        let mut per_duration = Vec::with_capacity(self.amounts.len());
        let mut any = false;
        for amount in &self.amounts {
            let pass = amount.record.pass_count.swap(0, Ordering::AcqRel);
            let limit = amount.record.limit_count.swap(0, Ordering::AcqRel);
            if pass != 0 || limit != 0 {
                any = true;
            }
            per_duration.push((amount.duration, pass, limit));
        }
        let shaping = self.traffic_shaping_limited.swap(0, Ordering::AcqRel);
        if shaping != 0 {
            any = true;
        }
        if !any {
            return None;
        }
        Some(WindowRecord {
            per_duration,
            traffic_shaping_limited: shaping,
        })
    }
}

impl std::fmt::Debug for RateLimitWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitWindow")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Action, AmountMode, MatcherSet, Resource, ReportConfig, RuleId};
    use std::time::Duration as StdDuration;

    fn local_rule(max: i64, dur_ms: u64) -> Arc<RateLimitRule> {
        Arc::new(RateLimitRule {
            id: RuleId {
                namespace: "ns".into(),
                service: "svc".into(),
                rule_id: "r1".into(),
                revision: "1".into(),
            },
            priority: 0,
            resource: Resource::Qps,
            rule_type: RuleType::Local,
            amount_mode: AmountMode::GlobalTotal,
            action: Action::Reject,
            labels: MatcherSet::default(),
            subset: MatcherSet::default(),
            amounts: vec![crate::model::Amount {
                max_amount: max,
                valid_duration: StdDuration::from_millis(dur_ms),
                precision: 100,
                start_amount: 0,
                end_amount: max,
                min_amount: 0,
            }],
            report: ReportConfig::default(),
            adjuster: None,
            failover: FailoverType::FailoverLocal,
            cluster_override: None,
            disable: false,
        })
    }

    fn key(rule: &RateLimitRule) -> RateLimitWindowKey {
        RateLimitWindowKey::new(rule, &Default::default(), &Default::default())
    }

    #[test]
    fn local_burst_admits_exactly_n_then_limits() {
        let rule = local_rule(10, 1000);
        let window = RateLimitWindow::new(rule.clone(), key(&rule), 10, 0);
        let mut ok = 0;
        let mut limited = 0;
        for _ in 0..20 {
            match window.allocate(1, 0).result {
                AllocateResult::Ok => ok += 1,
                AllocateResult::Limited => limited += 1,
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(limited, 10);

        let mut ok2 = 0;
        for _ in 0..20 {
            if window.allocate(1, 1000).result == AllocateResult::Ok {
                ok2 += 1;
            }
        }
        assert_eq!(ok2, 10);
    }

    #[tokio::test]
    async fn wait_remote_init_times_out_for_global_without_sync() {
        let rule = {
            let mut r = (*local_rule(10, 1000)).clone();
            r.rule_type = RuleType::Global;
            Arc::new(r)
        };
        let window = RateLimitWindow::new(rule.clone(), key(&rule), 10, 0);
        let got = window.wait_remote_init(Duration::from_millis(20)).await;
        assert!(!got);
    }

    #[test]
    fn make_deleted_is_idempotent() {
        let rule = local_rule(1, 1000);
        let window = RateLimitWindow::new(rule.clone(), key(&rule), 1, 0);
        assert!(window.make_deleted());
        assert!(!window.make_deleted());
        assert!(window.is_deleted());
    }

    #[test]
    fn global_degraded_without_sync_falls_back_to_local_budget() {
        let rule = {
            let mut r = (*local_rule(10, 2000)).clone();
            r.rule_type = RuleType::Global;
            r.failover = FailoverType::FailoverLocal;
            Arc::new(r)
        };
        let window = RateLimitWindow::new(rule.clone(), key(&rule), 10, 0);
        let mut ok = 0;
        let mut outcome = None;
        for _ in 0..12 {
            let o = window.allocate(1, 0);
            if o.result == AllocateResult::Ok {
                ok += 1;
            }
            outcome = Some(o);
        }
        assert_eq!(ok, 10);
        assert!(outcome.unwrap().is_degrade);
    }
}
