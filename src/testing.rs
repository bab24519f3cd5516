//! In-memory fakes for the external collaborators this crate depends on but
//! does not implement (`ServiceResolver`, `LocalRegistry`, `StreamClient`).
//! Used by this crate's own tests and by the demo binary; a production
//! embedder supplies real implementations backed by its control plane and
//! gRPC transport instead.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connector::transport::{
    InitRequest, InitResponse, QuotaCounter, QuotaLeft, QuotaMode, ReportRequest, ReportResponse,
    StreamClient, TimeAdjustResponse,
};
use crate::error::{QuotaError, QuotaResult};
use crate::model::RateLimitRule;
use crate::registry::{Instance, LocalRegistry, ServiceDataStatus, ServiceResolver, ServiceRuleData};

/// A registry with a fixed, pre-populated rule set per `(namespace, service)`.
/// Never returns `NotFound` once seeded; mirrors the happy path of a control
/// plane that has already delivered its first push.
#[derive(Default)]
pub struct StaticRegistry {
    services: Mutex<HashMap<(String, String), ServiceRuleData>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rules(&self, namespace: &str, service: &str, revision: &str, rules: Vec<RateLimitRule>) {
        self.services.lock().insert(
            (namespace.to_string(), service.to_string()),
            ServiceRuleData { revision: revision.to_string(), rules },
        );
    }
}

#[async_trait]
impl LocalRegistry for StaticRegistry {
    async fn get_service_data(
        &self,
        namespace: &str,
        service: &str,
        _timeout: Duration,
    ) -> QuotaResult<(ServiceDataStatus, ServiceRuleData)> {
        match self.services.lock().get(&(namespace.to_string(), service.to_string())) {
            Some(data) => Ok((ServiceDataStatus::Found, data.clone())),
            None => Ok((ServiceDataStatus::NotFound, ServiceRuleData::default())),
        }
    }

    async fn get_rule_label_keys(
        &self,
        namespace: &str,
        service: &str,
        _timeout: Duration,
    ) -> QuotaResult<BTreeSet<String>> {
        let services = self.services.lock();
        let Some(data) = services.get(&(namespace.to_string(), service.to_string())) else {
            return Ok(BTreeSet::new());
        };
        Ok(data
            .rules
            .iter()
            .flat_map(|r| r.labels.keys().map(str::to_string))
            .collect())
    }
}

/// Always resolves to the single instance it was built with. Good enough for
/// tests and the demo binary, which talk to one fake quota server.
pub struct FixedResolver {
    instance: Instance,
    failures: AtomicU32,
}

impl FixedResolver {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            instance: Instance { id: addr.to_string(), addr },
            failures: AtomicU32::new(0),
        }
    }

    pub fn reported_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ServiceResolver for FixedResolver {
    async fn select_instance(&self, _namespace: &str, _service: &str, _hash_key: &str) -> QuotaResult<Instance> {
        Ok(self.instance.clone())
    }

    async fn report_call_result(&self, _instance: &Instance, success: bool) {
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A quota-server fake: every `init`'d counter starts with `left` equal to
/// its requested max amount and is decremented by `used` on every `report`.
/// No network, no persistence — one process's view of server-held residual
/// quota, held in memory.
pub struct FakeQuotaServer {
    server_timestamp_offset_ms: AtomicI64,
    next_counter_key: AtomicU32,
    counters: Mutex<HashMap<u32, i64>>,
    next_client_key: AtomicU64,
}

impl Default for FakeQuotaServer {
    fn default() -> Self {
        Self {
            server_timestamp_offset_ms: AtomicI64::new(0),
            next_counter_key: AtomicU32::new(1),
            counters: Mutex::new(HashMap::new()),
            next_client_key: AtomicU64::new(1),
        }
    }
}

impl FakeQuotaServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulates clock skew between this fake server and the local process.
    pub fn set_time_offset_ms(&self, offset: i64) {
        self.server_timestamp_offset_ms.store(offset, Ordering::Relaxed);
    }

    fn now_ms() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
    }
}

#[async_trait]
impl StreamClient for FakeQuotaServer {
    async fn time_adjust(&self, _timeout: Duration) -> QuotaResult<TimeAdjustResponse> {
        Ok(TimeAdjustResponse {
            server_timestamp_ms: Self::now_ms() + self.server_timestamp_offset_ms.load(Ordering::Relaxed),
        })
    }

    async fn init(&self, req: InitRequest, _timeout: Duration) -> QuotaResult<InitResponse> {
        let mut counters = self.counters.lock();
        let resp_counters = req
            .totals
            .iter()
            .map(|total| {
                let key = self.next_counter_key.fetch_add(1, Ordering::Relaxed);
                let left = match total.mode {
                    QuotaMode::Whole => total.max_amount,
                    QuotaMode::Divide => total.max_amount,
                };
                counters.insert(key, left);
                QuotaCounter { counter_key: key, duration_ms: total.duration_ms, left, client_count: 1 }
            })
            .collect();
        Ok(InitResponse {
            client_key: self.next_client_key.fetch_add(1, Ordering::Relaxed),
            counters: resp_counters,
        })
    }

    async fn report(&self, req: ReportRequest, _timeout: Duration) -> QuotaResult<ReportResponse> {
        let mut counters = self.counters.lock();
        let mut lefts = Vec::with_capacity(req.sums.len());
        for sum in &req.sums {
            let Some(left) = counters.get_mut(&sum.counter_key) else {
                return Err(QuotaError::ResourceNotFound);
            };
            *left -= sum.used as i64;
            lefts.push(QuotaLeft { counter_key: sum.counter_key, left: *left });
        }
        Ok(ReportResponse { lefts })
    }
}

/// A `StreamClient` that fails every call, for exercising the
/// local-fallback/degrade paths.
#[derive(Default)]
pub struct AlwaysFailingClient;

#[async_trait]
impl StreamClient for AlwaysFailingClient {
    async fn time_adjust(&self, _timeout: Duration) -> QuotaResult<TimeAdjustResponse> {
        Err(QuotaError::Timeout)
    }

    async fn init(&self, _req: InitRequest, _timeout: Duration) -> QuotaResult<InitResponse> {
        Err(QuotaError::Timeout)
    }

    async fn report(&self, _req: ReportRequest, _timeout: Duration) -> QuotaResult<ReportResponse> {
        Err(QuotaError::Timeout)
    }
}
