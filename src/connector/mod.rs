//! Selects and owns per-instance connections to the rate-limit service, and
//! drives every synced window's init/report/time-adjust traffic over them.

pub mod connection;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::connector::connection::{now_ms, Connection};
use crate::error::{QuotaError, QuotaResult};
use crate::model::RuleId;
use crate::reactor::{Reactor, TimerHandle};
use crate::registry::{Instance, ServiceResolver};
use crate::window::RateLimitWindow;
pub use transport::StreamClient;

const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REMOVE_AFTER_IDLE: Duration = Duration::from_secs(60);

/// Builds a [`StreamClient`] for a resolved instance. A production embedder
/// supplies one backed by its own gRPC/HTTP2 stack; tests and the demo
/// binary use an in-memory fake.
pub type StreamClientFactory = Arc<dyn Fn(&Instance) -> Arc<dyn StreamClient> + Send + Sync>;

pub struct RateLimitConnector {
    reactor: Reactor,
    resolver: Arc<dyn ServiceResolver>,
    client_factory: StreamClientFactory,
    request_timeout: Duration,
    idle_check_interval: Duration,
    remove_after_idle: Duration,
    next_numeric_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    idle_timer: Mutex<Option<TimerHandle>>,
}

impl RateLimitConnector {
    pub fn new(
        reactor: Reactor,
        resolver: Arc<dyn ServiceResolver>,
        client_factory: StreamClientFactory,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            resolver,
            client_factory,
            request_timeout,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            remove_after_idle: DEFAULT_REMOVE_AFTER_IDLE,
            next_numeric_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            idle_timer: Mutex::new(None),
        })
    }

    /// Starts the periodic idle-connection sweep. Call once after
    /// construction; a connector with no idle check would accumulate a
    /// connection per quota server forever.
    pub fn start_idle_check(self: &Arc<Self>) {
        let connector = self.clone();
        let handle = self.reactor.add_timer(self.idle_check_interval, move || {
            let connector = connector.clone();
            async move { connector.sweep_idle_connections() }
        });
        *self.idle_timer.lock() = Some(handle);
    }

    fn sweep_idle_connections(&self) {
        let idle_check_time = now_ms() - self.remove_after_idle.as_millis() as i64;
        let mut connections = self.connections.lock();
        let stale: Vec<String> = connections
            .iter()
            .filter(|(_, conn)| conn.is_idle(idle_check_time))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(conn) = connections.remove(&id) {
                conn.close();
                self.reactor.defer_delete(conn);
            }
        }
    }

    /// Selects (or opens) the connection for this rule/window's metric
    /// cluster and routes the window onto it. The window's `RuleId`
    /// (namespace/service) is the cluster to resolve unless the rule
    /// overrides it, and `metric_id` is the consistent-hash key so every
    /// client targeting the same window converges on the same instance.
    pub async fn sync_window(
        self: &Arc<Self>,
        window: Arc<RateLimitWindow>,
        metric_id: &str,
    ) -> QuotaResult<()> {
        let (namespace, service) = cluster_for(&window.rule.id, window.rule.cluster_override.as_ref());
        let connection = self.select_connection(&namespace, &service, metric_id).await?;
        connection.add_window(window);
        Ok(())
    }

    async fn select_connection(
        self: &Arc<Self>,
        namespace: &str,
        service: &str,
        hash_key: &str,
    ) -> QuotaResult<Arc<Connection>> {
        let instance = self.resolver.select_instance(namespace, service, hash_key).await?;

        if let Some(existing) = self.connections.lock().get(&instance.id) {
            return Ok(existing.clone());
        }

        let client = (self.client_factory)(&instance);
        let numeric_id = self.next_numeric_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(
            numeric_id,
            instance.id.clone(),
            instance.clone(),
            client,
            self.reactor.clone(),
            Arc::downgrade(self),
            self.request_timeout,
        );

        let mut connections = self.connections.lock();
        // Another task may have raced us to create the same instance's
        // connection while we awaited `select_instance`/construction; keep
        // whichever was inserted first so windows don't split across two
        // live connections to the same server.
        Ok(connections.entry(instance.id.clone()).or_insert(connection).clone())
    }

    pub async fn report_call_result(&self, instance: &Instance, success: bool) {
        self.resolver.report_call_result(instance, success).await;
    }

    /// Drops a connection from the pool outside the idle sweep — used by a
    /// connection's own RPC-failure teardown so a closing connection is
    /// never handed back out by `select_connection` while its defer-delete
    /// is still pending.
    pub(crate) fn remove_connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().remove(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

fn cluster_for(rule_id: &RuleId, override_cluster: Option<&(String, String)>) -> (String, String) {
    match override_cluster {
        Some((ns, svc)) => (ns.clone(), svc.clone()),
        None => (rule_id.namespace.clone(), rule_id.service.clone()),
    }
}

impl From<crate::error::ConnectorError> for QuotaError {
    fn from(err: crate::error::ConnectorError) -> Self {
        QuotaError::Internal(err.to_string())
    }
}
