//! One long-lived duplex connection to a quota-server instance, and every
//! window currently synced over it.
//!
//! Mirrors the split in the design this is grounded on: a connector selects
//! and owns per-instance connections; each connection owns the windows
//! routed to it and the init/report/time-adjust traffic for those windows.
//! The transport itself is the [`crate::connector::transport::StreamClient`]
//! trait boundary — this module only sequences calls against it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;

use crate::bucket::NO_SPEEDUP;
use crate::connector::transport::{
    InitRequest, LimitTarget, QuotaMode, QuotaSum, QuotaTotal, ReportRequest, StreamClient,
};
use crate::connector::RateLimitConnector;
use crate::model::RateLimitWindowKey;
use crate::reactor::{Reactor, TimerHandle};
use crate::registry::Instance;
use crate::window::RateLimitWindow;

const TIME_SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Delay before a window re-selects a server after its connection failed,
/// per the error handling design's reconnect backoff.
const RESELECT_AFTER_FAILURE: Duration = Duration::from_millis(200);
/// The speed-up hint is only honored while a rule's longest amount is within
/// this many multiples of the report interval — otherwise long-duration
/// windows would report needlessly often chasing a short-duration bucket's
/// speedup.
const MAX_SPEEDUP_DURATION_MULTIPLE: u32 = 25;

/// `reportInterval ± jitter`, so many clients started at once don't all
/// report in lockstep against the same quota server.
fn jittered(interval: Duration) -> Duration {
    let frac: f64 = rand::thread_rng().gen_range(-0.1..=0.1);
    let millis = (interval.as_millis() as f64 * (1.0 + frac)).max(0.0);
    Duration::from_millis(millis as u64)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A single server connection. Owns every window currently routed to it and
/// the timers driving their init/report traffic.
pub struct Connection {
    pub id: String,
    numeric_id: u64,
    pub instance: Instance,
    client: Arc<dyn StreamClient>,
    reactor: Reactor,
    /// The connector that owns this connection's slot in its instance map;
    /// used on RPC failure to circuit-break the instance and drop this
    /// connection from the pool. `Weak` so a connection never keeps its
    /// owning connector alive.
    connector: Weak<RateLimitConnector>,
    request_timeout: Duration,
    time_diff_ms: AtomicI64,
    last_used_ms: AtomicI64,
    client_key: AtomicU64,
    windows: Mutex<HashMap<RateLimitWindowKey, Arc<RateLimitWindow>>>,
    report_timers: Mutex<HashMap<RateLimitWindowKey, TimerHandle>>,
    time_sync_timer: Mutex<Option<TimerHandle>>,
    /// Set once an RPC failure starts tearing this connection down, so a
    /// second concurrent failure (init and report can race) doesn't double
    /// report the failure or double-reschedule the connection's windows.
    is_closing: AtomicBool,
}

impl Connection {
    pub fn new(
        numeric_id: u64,
        id: String,
        instance: Instance,
        client: Arc<dyn StreamClient>,
        reactor: Reactor,
        connector: Weak<RateLimitConnector>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            id,
            numeric_id,
            instance,
            client,
            reactor: reactor.clone(),
            connector,
            request_timeout,
            time_diff_ms: AtomicI64::new(0),
            last_used_ms: AtomicI64::new(now_ms()),
            client_key: AtomicU64::new(0),
            windows: Mutex::new(HashMap::new()),
            report_timers: Mutex::new(HashMap::new()),
            time_sync_timer: Mutex::new(None),
            is_closing: AtomicBool::new(false),
        });
        conn.start_time_sync();
        conn
    }

    fn start_time_sync(self: &Arc<Self>) {
        let initial = self.clone();
        self.reactor.spawn(async move {
            initial.do_time_sync().await;
        });
        let periodic = self.clone();
        let handle = self.reactor.add_timer(TIME_SYNC_INTERVAL, move || {
            let conn = periodic.clone();
            async move { conn.do_time_sync().await }
        });
        *self.time_sync_timer.lock() = Some(handle);
    }

    async fn do_time_sync(self: &Arc<Self>) {
        match self.client.time_adjust(self.request_timeout).await {
            Ok(resp) => {
                let diff = resp.server_timestamp_ms - now_ms();
                self.time_diff_ms.store(diff, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::warn!(connection_id = %self.id, error = %err, "time_adjust failed, keeping last known skew");
            }
        }
    }

    /// `last_used_time_ < idle_check_time` with no windows left routed here.
    pub fn is_idle(&self, idle_check_time_ms: i64) -> bool {
        self.windows.lock().is_empty() && self.last_used_ms.load(Ordering::Relaxed) < idle_check_time_ms
    }

    pub fn window_count(&self) -> usize {
        self.windows.lock().len()
    }

    /// Route a window onto this connection: records it, kicks off its first
    /// init, and schedules its recurring report task.
    pub fn add_window(self: &Arc<Self>, window: Arc<RateLimitWindow>) {
        window.set_connecting();
        window.set_connection_id(self.numeric_id);
        self.windows.lock().insert(window.key.clone(), window.clone());
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);

        let conn = self.clone();
        let init_window = window.clone();
        self.reactor.spawn(async move {
            conn.send_init(init_window).await;
        });

        let delay = jittered(window.rule.report.interval);
        self.schedule_report(window, delay);
    }

    /// (Re)schedules one window's next report as a single-shot delayed
    /// task, replacing whatever timer was previously installed for it.
    fn schedule_report(self: &Arc<Self>, window: Arc<RateLimitWindow>, delay: Duration) {
        let conn = self.clone();
        let key = window.key.clone();
        let handle = self
            .reactor
            .add_oneshot(delay, move || async move { conn.send_report(window, now_ms()).await });
        self.report_timers.lock().insert(key, handle);
    }

    /// `min(nextReportHint, reportInterval)`, clamped to the plain interval
    /// whenever the rule's longest amount is more than `25 ×` the report
    /// interval away (see `MAX_SPEEDUP_DURATION_MULTIPLE`).
    fn next_report_delay(window: &RateLimitWindow, speedup_hint_ms: u64) -> Duration {
        let interval = window.rule.report.interval;
        let max_duration = window.amounts().map(|(d, _)| d).max().unwrap_or(interval);
        if max_duration > interval * MAX_SPEEDUP_DURATION_MULTIPLE {
            return interval;
        }
        if speedup_hint_ms == NO_SPEEDUP {
            return interval;
        }
        Duration::from_millis(speedup_hint_ms).min(interval)
    }

    pub fn remove_window(&self, key: &RateLimitWindowKey) {
        self.windows.lock().remove(key);
        if let Some(handle) = self.report_timers.lock().remove(key) {
            self.reactor.cancel_timer(handle);
        }
    }

    async fn send_init(self: &Arc<Self>, window: Arc<RateLimitWindow>) {
        let totals: Vec<QuotaTotal> = window
            .amounts()
            .map(|(dur, bucket)| QuotaTotal {
                max_amount: bucket.local_max_amount(),
                duration_ms: dur.as_millis() as u64,
                mode: QuotaMode::Whole,
            })
            .collect();

        let req = InitRequest {
            target: LimitTarget {
                namespace: window.rule.id.namespace.clone(),
                service: window.rule.id.service.clone(),
                canonical_labels: window.key.canonical_labels.clone(),
            },
            rule_id: window.rule.id.clone(),
            totals,
        };

        match self.client.init(req, self.request_timeout).await {
            Ok(resp) => {
                self.client_key.store(resp.client_key, Ordering::Relaxed);
                let mut client_count = 0u32;
                for counter in &resp.counters {
                    window.install_counter_key(counter.duration_ms, counter.counter_key);
                    client_count = client_count.max(counter.client_count);
                }
                if client_count > 0 {
                    window.apply_client_count(client_count);
                }
                let wall = now_ms();
                window.note_sync(wall, self.time_diff_ms.load(Ordering::Relaxed));
                tracing::debug!(window = ?window.key, connection_id = %self.id, "window init complete");
            }
            Err(err) => {
                tracing::warn!(
                    window = ?window.key,
                    connection_id = %self.id,
                    error = %err,
                    "init failed, closing connection",
                );
                self.handle_rpc_failure().await;
            }
        }
    }

    /// Drains every amount's pending remote usage and reports it in one
    /// call, then applies the server's residual-quota response back into
    /// each bucket.
    async fn send_report(self: &Arc<Self>, window: Arc<RateLimitWindow>, wall_ms: i64) {
        let now = Duration::from_millis(wall_ms.max(0) as u64);
        let mut sums = Vec::new();
        let mut bucket_times: HashMap<u32, u64> = HashMap::new();
        for (dur, bucket) in window.amounts() {
            let Some(counter_key) = window.counter_key_for(dur.as_millis() as u64) else {
                continue;
            };
            let bucket_time = bucket.expect_bucket_time(now);
            let usage = bucket.prepare_pending_quota(bucket_time);
            if usage.allocated == 0 && usage.rejected == 0 {
                continue;
            }
            bucket_times.insert(counter_key, bucket_time);
            sums.push(QuotaSum {
                counter_key,
                used: usage.allocated,
                limited: usage.rejected,
            });
        }
        if sums.is_empty() {
            // Nothing to report this cycle; still reschedule at the normal
            // cadence, since the report loop is now a reschedule-on-fire
            // single-shot rather than a free-running periodic ticker.
            let interval = window.rule.report.interval;
            self.schedule_report(window, interval);
            return;
        }

        let ack_by_key: HashMap<u32, u64> = sums.iter().map(|s| (s.counter_key, s.used)).collect();
        let req = ReportRequest {
            client_key: self.client_key.load(Ordering::Relaxed),
            sums,
        };

        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
        match self.client.report(req, self.request_timeout).await {
            Ok(resp) => {
                let wall = now_ms();
                let now = Duration::from_millis(wall.max(0) as u64);
                let mut speedup_hint_ms = NO_SPEEDUP;
                for left in resp.lefts {
                    let Some(bucket) = window.token_bucket_for_counter_key(left.counter_key) else {
                        continue;
                    };
                    let bucket_time = *bucket_times.get(&left.counter_key).unwrap_or(&0);
                    let ack = *ack_by_key.get(&left.counter_key).unwrap_or(&0);
                    let hint = bucket.refresh_token(left.left, ack, bucket_time, false, now);
                    speedup_hint_ms = speedup_hint_ms.min(hint);
                }
                window.note_sync(wall, self.time_diff_ms.load(Ordering::Relaxed));
                let delay = Self::next_report_delay(&window, speedup_hint_ms);
                self.schedule_report(window, delay);
            }
            Err(err) => {
                tracing::warn!(
                    window = ?window.key,
                    connection_id = %self.id,
                    error = %err,
                    "report failed, closing connection",
                );
                self.handle_rpc_failure().await;
            }
        }
    }

    /// Init/report RPC failure: the spec's connection-closing path. Reports
    /// `callResult=ServerError` to the instance pool so the resolver can
    /// circuit-break it, drops this connection from the connector's map,
    /// cancels every timer this connection owns, reschedules all of its
    /// windows to re-select a (likely different) server after
    /// `RESELECT_AFTER_FAILURE`, and defer-deletes the connection itself.
    /// Idempotent: a second concurrent failure (init and report can race)
    /// observes `is_closing` already set and does nothing further.
    async fn handle_rpc_failure(self: &Arc<Self>) {
        if self.is_closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(connector) = self.connector.upgrade() else {
            self.close();
            return;
        };
        connector.remove_connection(&self.id);
        connector.report_call_result(&self.instance, false).await;

        let windows: Vec<Arc<RateLimitWindow>> = self.windows.lock().values().cloned().collect();
        self.close();

        for window in windows {
            if window.is_deleted() {
                continue;
            }
            let connector = connector.clone();
            self.reactor.add_oneshot(RESELECT_AFTER_FAILURE, move || async move {
                if window.is_deleted() {
                    return;
                }
                let metric_id = window.rule.metric_id(&window.key.canonical_labels);
                if let Err(err) = connector.sync_window(window, &metric_id).await {
                    tracing::warn!(error = %err, "failed to re-select a quota server after connection failure");
                }
            });
        }

        self.reactor.defer_delete(self.clone());
    }

    /// Tear down every timer this connection owns. Callers must still hand
    /// the `Arc<Connection>` itself to [`Reactor::defer_delete`] — closing a
    /// connection from inside one of its own callbacks must not drop it
    /// synchronously.
    pub fn close(&self) {
        if let Some(handle) = self.time_sync_timer.lock().take() {
            self.reactor.cancel_timer(handle);
        }
        let mut timers = self.report_timers.lock();
        for (_, handle) in timers.drain() {
            self.reactor.cancel_timer(handle);
        }
        for (_, window) in self.windows.lock().drain() {
            window.mark_expired();
        }
    }
}
