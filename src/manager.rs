//! `QuotaManager`: the public entry point tying rule matching, the window
//! table, and the connector together behind `GetQuota`/`UpdateCallResult`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use concread::arcache::{ARCache, ARCacheBuilder};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::adjuster::call_metric::CallResultType;
use crate::connector::{RateLimitConnector, StreamClientFactory};
use crate::error::{QuotaError, QuotaResult};
use crate::model::{match_rule, RateLimitRule, RateLimitWindowKey, RuleType};
use crate::reactor::{Reactor, TimerHandle};
use crate::recorder::Recorder;
use crate::registry::{LocalRegistry, ServiceDataStatus, ServiceResolver};
use crate::window::{AllocateResult, RateLimitWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Global,
    Local,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub enable: bool,
    pub mode: Mode,
    pub rate_limit_cluster: Option<(String, String)>,
    pub message_timeout: Duration,
    /// `0` selects the unbounded `DashMap` + periodic sweep table; any other
    /// value builds a bounded `concread` `ARCache` of that capacity.
    pub lru_size: usize,
    pub clear_expired_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            mode: Mode::Local,
            rate_limit_cluster: None,
            message_timeout: Duration::from_millis(1000),
            lru_size: 0,
            clear_expired_interval: Duration::from_secs(10),
        }
    }
}

/// `{Ok|Limited, leftQuota, allQuota, duration, isDegrade, waitTimeMs}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaResponse {
    pub result: AllocateResult,
    pub left_quota: i64,
    pub all_quota: i64,
    pub duration: Duration,
    pub is_degrade: bool,
    pub wait: Duration,
}

/// Renders a matched rule into the `jsonRule` shape `FetchRule` returns.
/// Label/subset matcher *values* (regex patterns, exact literals) are an
/// internal representation detail; only the keys a caller would need to
/// populate are surfaced, matching what `FetchRuleLabelKeys` already
/// exposes for the same rule.
fn rule_to_json(rule: &RateLimitRule) -> serde_json::Value {
    let amounts: Vec<serde_json::Value> = rule
        .amounts
        .iter()
        .map(|a| {
            serde_json::json!({
                "maxAmount": a.max_amount,
                "validDurationMs": a.valid_duration.as_millis() as u64,
                "precision": a.precision,
                "startAmount": a.start_amount,
                "endAmount": a.end_amount,
                "minAmount": a.min_amount,
            })
        })
        .collect();

    serde_json::json!({
        "namespace": rule.id.namespace,
        "service": rule.id.service,
        "ruleId": rule.id.rule_id,
        "revision": rule.id.revision,
        "priority": rule.priority,
        "type": match rule.rule_type {
            RuleType::Local => "LOCAL",
            RuleType::Global => "GLOBAL",
        },
        "amountMode": match rule.amount_mode {
            crate::model::AmountMode::GlobalTotal => "GLOBAL_TOTAL",
            crate::model::AmountMode::ShareEqually => "SHARE_EQUALLY",
        },
        "action": match rule.action {
            crate::model::Action::Reject => "REJECT",
            crate::model::Action::Unirate => "UNIRATE",
        },
        "labelKeys": rule.labels.keys().collect::<Vec<_>>(),
        "subsetKeys": rule.subset.keys().collect::<Vec<_>>(),
        "amounts": amounts,
        "reportIntervalMs": rule.report.interval.as_millis() as u64,
        "failover": match rule.failover {
            crate::model::FailoverType::FailoverLocal => "FAILOVER_LOCAL",
            crate::model::FailoverType::FailoverPass => "FAILOVER_PASS",
        },
        "disable": rule.disable,
    })
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The window table backing the manager. Bounded mode trades the periodic
/// expiry sweep for capacity-driven LRU eviction — `concread::ARCache`
/// doesn't expose a cheap full-table scan, so `ClearExpiredWindow` only runs
/// against the unbounded variant; bounded tables rely on access-time LRU
/// plus a lazy expiry check on lookup (see [`WindowTable::get`]).
enum WindowTable {
    Unbounded(DashMap<RateLimitWindowKey, Arc<RateLimitWindow>>),
    Bounded(ARCache<RateLimitWindowKey, Arc<RateLimitWindow>>),
}

impl WindowTable {
    fn new(lru_size: usize) -> Self {
        if lru_size == 0 {
            WindowTable::Unbounded(DashMap::new())
        } else {
            let cache = ARCacheBuilder::new()
                .set_expected_workload(lru_size, 4, 1, 1, false)
                .build()
                .expect("rate limit window cache construction should not fail");
            WindowTable::Bounded(cache)
        }
    }

    fn get(&self, key: &RateLimitWindowKey, now_ms: i64) -> Option<Arc<RateLimitWindow>> {
        match self {
            WindowTable::Unbounded(map) => map.get(key).map(|e| e.value().clone()),
            WindowTable::Bounded(cache) => {
                let mut reader = cache.read();
                let found = reader.get(key).cloned();
                if let Some(window) = &found {
                    if window.is_expired(now_ms) || window.is_deleted() {
                        return None;
                    }
                }
                found
            }
        }
    }

    fn insert(&self, key: RateLimitWindowKey, window: Arc<RateLimitWindow>) {
        match self {
            WindowTable::Unbounded(map) => {
                map.insert(key, window);
            }
            WindowTable::Bounded(cache) => {
                let mut writer = cache.write();
                writer.insert(key, window);
                writer.commit();
            }
        }
    }

    fn remove(&self, key: &RateLimitWindowKey) {
        match self {
            WindowTable::Unbounded(map) => {
                map.remove(key);
            }
            WindowTable::Bounded(cache) => {
                let mut writer = cache.write();
                writer.remove(key);
                writer.commit();
            }
        }
    }

    /// `ClearExpiredWindow`. A no-op on the bounded variant (see struct
    /// docs) — returns the evicted windows so the caller can `MakeDeleted`
    /// and defer-delete them.
    fn sweep_expired(&self, now_ms: i64) -> Vec<(RateLimitWindowKey, Arc<RateLimitWindow>)> {
        match self {
            WindowTable::Unbounded(map) => {
                let expired: Vec<_> = map
                    .iter()
                    .filter(|e| e.value().is_expired(now_ms))
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                for (key, _) in &expired {
                    map.remove(key);
                }
                expired
            }
            WindowTable::Bounded(_) => Vec::new(),
        }
    }
}

pub struct QuotaManager {
    reactor: Reactor,
    registry: Arc<dyn LocalRegistry>,
    connector: Option<Arc<RateLimitConnector>>,
    recorder: Arc<Recorder>,
    windows: WindowTable,
    window_init_locks: DashMap<RateLimitWindowKey, Arc<AsyncMutex<()>>>,
    config: ManagerConfig,
    clear_timer: std::sync::Mutex<Option<TimerHandle>>,
    report_timer: std::sync::Mutex<Option<TimerHandle>>,
    climb_timer: std::sync::Mutex<Option<TimerHandle>>,
    next_instance_hint: AtomicU64,
}

impl QuotaManager {
    pub fn new(
        reactor: Reactor,
        registry: Arc<dyn LocalRegistry>,
        resolver: Arc<dyn ServiceResolver>,
        client_factory: StreamClientFactory,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let connector = match config.mode {
            Mode::Global => Some(RateLimitConnector::new(
                reactor.clone(),
                resolver,
                client_factory,
                config.message_timeout,
            )),
            Mode::Local => None,
        };

        Arc::new(Self {
            reactor,
            registry,
            connector,
            recorder: Arc::new(Recorder::new()),
            windows: WindowTable::new(config.lru_size),
            window_init_locks: DashMap::new(),
            config,
            clear_timer: std::sync::Mutex::new(None),
            report_timer: std::sync::Mutex::new(None),
            climb_timer: std::sync::Mutex::new(None),
            next_instance_hint: AtomicU64::new(1),
        })
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Starts the manager's background tasks: idle-connection sweep (global
    /// mode only), expired-window sweep, telemetry drain, and climb judging.
    pub fn start(self: &Arc<Self>) {
        if let Some(connector) = &self.connector {
            connector.start_idle_check();
        }

        let manager = self.clone();
        let handle = self
            .reactor
            .add_timer(self.config.clear_expired_interval, move || {
                let manager = manager.clone();
                async move { manager.clear_expired_windows() }
            });
        *self.clear_timer.lock().unwrap() = Some(handle);

        let manager = self.clone();
        let handle = self.reactor.add_timer(Duration::from_secs(10), move || {
            let manager = manager.clone();
            async move { manager.drain_telemetry() }
        });
        *self.report_timer.lock().unwrap() = Some(handle);

        let manager = self.clone();
        let handle = self.reactor.add_timer(Duration::from_secs(10), move || {
            let manager = manager.clone();
            async move { manager.run_climb_judges() }
        });
        *self.climb_timer.lock().unwrap() = Some(handle);
    }

    /// `GetQuota(service, labels, subset, acquire, timeout)`.
    pub async fn get_quota(
        self: &Arc<Self>,
        namespace: &str,
        service: &str,
        labels: &BTreeMap<String, String>,
        subset: &BTreeMap<String, String>,
        acquire: i64,
        timeout: Duration,
    ) -> QuotaResult<QuotaResponse> {
        if !self.config.enable {
            return Ok(Self::permit_all(acquire));
        }

        let (status, data) = self
            .registry
            .get_service_data(namespace, service, timeout)
            .await?;
        if matches!(status, ServiceDataStatus::NotFound) {
            return Ok(Self::permit_all(acquire));
        }

        let Some(rule) = match_rule(&data.rules, labels, subset) else {
            return Ok(Self::permit_all(acquire));
        };
        let rule = Arc::new(rule.clone());

        let window = self.get_or_create_window(rule.clone(), labels, subset).await;
        window.wait_remote_init(timeout).await;

        let outcome = window.allocate(acquire, now_ms());
        Ok(QuotaResponse {
            result: outcome.result,
            left_quota: outcome.left_quota,
            all_quota: outcome.all_quota,
            duration: outcome.duration,
            is_degrade: outcome.is_degrade,
            wait: outcome.wait,
        })
    }

    fn permit_all(acquire: i64) -> QuotaResponse {
        QuotaResponse {
            result: AllocateResult::Ok,
            left_quota: acquire,
            all_quota: acquire,
            duration: Duration::ZERO,
            is_degrade: false,
            wait: Duration::ZERO,
        }
    }

    /// `InitQuotaWindow` — eager warm-up, returns once the first sync
    /// completes or `timeout` elapses.
    pub async fn init_quota_window(
        self: &Arc<Self>,
        namespace: &str,
        service: &str,
        labels: &BTreeMap<String, String>,
        subset: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> QuotaResult<()> {
        let (status, data) = self
            .registry
            .get_service_data(namespace, service, timeout)
            .await?;
        if matches!(status, ServiceDataStatus::NotFound) {
            return Ok(());
        }
        let Some(rule) = match_rule(&data.rules, labels, subset) else {
            return Ok(());
        };
        let rule = Arc::new(rule.clone());
        let window = self.get_or_create_window(rule, labels, subset).await;
        window.wait_remote_init(timeout).await;
        Ok(())
    }

    /// `UpdateCallResult` — feeds a completed call's outcome into the
    /// matching window's climb adjuster. Silently ignored (per the error
    /// handling design's `NotInit` rule) if no window has been allocated
    /// against yet for these labels/subset.
    pub fn update_call_result(
        &self,
        rule_for_key: &RateLimitRule,
        labels: &BTreeMap<String, String>,
        subset: &BTreeMap<String, String>,
        result: CallResultType,
        response_time_ms: u64,
        response_code: i32,
    ) -> QuotaResult<()> {
        let key = RateLimitWindowKey::new(rule_for_key, labels, subset);
        let now = now_ms();
        match self.windows.get(&key, now) {
            Some(window) => {
                window.record_call(now.max(0) as u64, result, response_time_ms, response_code);
                Ok(())
            }
            None => Err(QuotaError::NotInit),
        }
    }

    /// `FetchRule` — returns the matched rule serialised as `jsonRule`, the
    /// shape the control plane's own tooling expects (and the shape a
    /// cross-language embedder can consume without binding to this crate's
    /// Rust types).
    pub async fn fetch_rule(
        &self,
        namespace: &str,
        service: &str,
        labels: &BTreeMap<String, String>,
        subset: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> QuotaResult<Option<String>> {
        let (status, data) = self
            .registry
            .get_service_data(namespace, service, timeout)
            .await?;
        if matches!(status, ServiceDataStatus::NotFound) {
            return Ok(None);
        }
        let Some(rule) = match_rule(&data.rules, labels, subset) else {
            return Ok(None);
        };
        let json = serde_json::to_string(&rule_to_json(rule))
            .map_err(|err| QuotaError::Internal(err.to_string()))?;
        Ok(Some(json))
    }

    pub async fn fetch_rule_label_keys(
        &self,
        namespace: &str,
        service: &str,
        timeout: Duration,
    ) -> QuotaResult<std::collections::BTreeSet<String>> {
        self.registry.get_rule_label_keys(namespace, service, timeout).await
    }

    async fn get_or_create_window(
        self: &Arc<Self>,
        rule: Arc<RateLimitRule>,
        labels: &BTreeMap<String, String>,
        subset: &BTreeMap<String, String>,
    ) -> Arc<RateLimitWindow> {
        let key = RateLimitWindowKey::new(&rule, labels, subset);
        let now = now_ms();
        if let Some(window) = self.windows.get(&key, now) {
            return window;
        }

        let lock = self
            .window_init_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check now that we hold the per-key critical section: another
        // task may have created the window while we awaited the lock.
        if let Some(window) = self.windows.get(&key, now) {
            return window;
        }

        let local_max_amount = self.resolve_local_max_amount(&rule);
        let window = Arc::new(RateLimitWindow::new(rule.clone(), key.clone(), local_max_amount, now));
        self.windows.insert(key.clone(), window.clone());

        if matches!(rule.rule_type, RuleType::Global) {
            if let Some(connector) = self.connector.clone() {
                let metric_id = rule.metric_id(&window.key.canonical_labels);
                let sync_window = window.clone();
                self.reactor.spawn(async move {
                    if let Err(err) = connector.sync_window(sync_window, &metric_id).await {
                        tracing::warn!(error = %err, "failed to select a quota server for new window");
                    }
                });
            }
        }

        window
    }

    /// Resolves the primary amount's local fallback budget before any
    /// remote sync has happened. `ShareEqually` ultimately divides this by
    /// the connector-reported client count (`QuotaCounter::client_count`
    /// from the init response, applied via `RateLimitWindow::apply_client_count`
    /// once `send_init` completes), but until that first sync lands the
    /// window has no better estimate than the full configured amount — a
    /// single untallied replica is the only sound starting assumption.
    fn resolve_local_max_amount(&self, rule: &RateLimitRule) -> i64 {
        rule.amounts_by_duration()
            .first()
            .map(|a| a.max_amount)
            .unwrap_or(0)
    }

    fn clear_expired_windows(&self) {
        let now = now_ms();
        for (key, window) in self.windows.sweep_expired(now) {
            if window.make_deleted() {
                // The connection that owns this window's report/init timers
                // (if any) still holds its own `Arc` clone; those timers
                // keep firing against a deleted window until its own
                // `collect_record`/`prepare_pending_quota` calls settle to
                // zero, which is harmless busywork rather than a leak.
                self.window_init_locks.remove(&key);
                self.reactor.defer_delete(window);
            }
        }
    }

    fn drain_telemetry(&self) {
        if let WindowTable::Unbounded(map) = &self.windows {
            for entry in map.iter() {
                let window = entry.value();
                if let Some(record) = window.collect_record() {
                    self.recorder.record(&window.rule.id, &record);
                }
            }
        }
    }

    fn run_climb_judges(&self) {
        let now = now_ms();
        if let WindowTable::Unbounded(map) = &self.windows {
            for entry in map.iter() {
                entry.value().run_climb_judge(now);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;

    use crate::model::{Action, Amount, AmountMode, FailoverType, MatcherSet, Resource, RuleId};
    use crate::testing::{FakeQuotaServer, FixedResolver, StaticRegistry};

    fn rule(rule_type: RuleType, max_amount: i64) -> RateLimitRule {
        RateLimitRule {
            id: RuleId {
                namespace: "ns".into(),
                service: "svc".into(),
                rule_id: "r1".into(),
                revision: "1".into(),
            },
            priority: 0,
            resource: Resource::Qps,
            rule_type,
            amount_mode: AmountMode::GlobalTotal,
            action: Action::Reject,
            labels: MatcherSet::default(),
            subset: MatcherSet::default(),
            amounts: vec![Amount {
                max_amount,
                valid_duration: Duration::from_secs(1),
                precision: 100,
                start_amount: 0,
                end_amount: max_amount,
                min_amount: 0,
            }],
            report: Default::default(),
            adjuster: None,
            failover: FailoverType::FailoverLocal,
            cluster_override: None,
            disable: false,
        }
    }

    #[tokio::test]
    async fn local_mode_limits_after_configured_burst() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_rules("ns", "svc", "1", vec![rule(RuleType::Local, 3)]);
        let resolver = Arc::new(FixedResolver::new("127.0.0.1:1".parse::<SocketAddr>().unwrap()));
        let manager = QuotaManager::new(
            Reactor::attach(tokio::runtime::Handle::current()),
            registry,
            resolver,
            Arc::new(|_: &crate::registry::Instance| -> Arc<dyn crate::connector::StreamClient> {
                Arc::new(crate::testing::AlwaysFailingClient)
            }),
            ManagerConfig { mode: Mode::Local, ..Default::default() },
        );

        let labels = BTreeMap::new();
        let subset = BTreeMap::new();
        let mut ok = 0;
        let mut limited = 0;
        for _ in 0..5 {
            let resp = manager
                .get_quota("ns", "svc", &labels, &subset, 1, Duration::from_millis(50))
                .await
                .unwrap();
            match resp.result {
                AllocateResult::Ok => ok += 1,
                AllocateResult::Limited => limited += 1,
            }
        }
        assert_eq!(ok, 3);
        assert_eq!(limited, 2);
    }

    #[tokio::test]
    async fn unknown_service_permits_everything() {
        let registry = Arc::new(StaticRegistry::new());
        let resolver = Arc::new(FixedResolver::new("127.0.0.1:1".parse::<SocketAddr>().unwrap()));
        let manager = QuotaManager::new(
            Reactor::attach(tokio::runtime::Handle::current()),
            registry,
            resolver,
            Arc::new(|_: &crate::registry::Instance| -> Arc<dyn crate::connector::StreamClient> {
                Arc::new(crate::testing::AlwaysFailingClient)
            }),
            ManagerConfig::default(),
        );

        let resp = manager
            .get_quota("ns", "unregistered", &BTreeMap::new(), &BTreeMap::new(), 7, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(resp.result, AllocateResult::Ok);
        assert_eq!(resp.left_quota, 7);
    }

    #[tokio::test]
    async fn global_mode_syncs_with_fake_quota_server() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_rules("ns", "svc", "1", vec![rule(RuleType::Global, 5)]);
        let resolver = Arc::new(FixedResolver::new("127.0.0.1:1".parse::<SocketAddr>().unwrap()));
        let server = FakeQuotaServer::new();
        let client_factory: StreamClientFactory = Arc::new({
            let server = server.clone();
            move |_: &crate::registry::Instance| -> Arc<dyn crate::connector::StreamClient> { server.clone() }
        });
        let manager = QuotaManager::new(
            Reactor::attach(tokio::runtime::Handle::current()),
            registry,
            resolver,
            client_factory,
            ManagerConfig { mode: Mode::Global, ..Default::default() },
        );

        let resp = manager
            .get_quota("ns", "svc", &BTreeMap::new(), &BTreeMap::new(), 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(resp.result, AllocateResult::Ok);
        assert!(!resp.is_degrade, "expected sync to complete before the wait_remote_init deadline");
    }
}
