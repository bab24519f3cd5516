//! Contracts for the external collaborators this core depends on but does
//! not implement: service discovery/instance selection and the rule
//! registry. Production embeddings plug in real implementations (backed by
//! the mesh's control-plane client); this crate only defines the trait
//! boundary plus the in-memory fakes used by its own tests and demo binary.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QuotaResult;
use crate::model::RateLimitRule;

/// One resolved quota-server (or metric-service) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub addr: SocketAddr,
}

/// Selects a server instance for a given cluster by consistent hash.
/// Out of scope for this core: health-checking, load balancing policy and
/// the hash ring itself live in the circuit-breaker/load-balancer
/// subsystems this crate shares a reactor with but does not implement.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// `hash_key` is the metric id (`service + "#" + canonicalLabels`): a
    /// pure function of the rule and labels, so all clients targeting the
    /// same rule converge on the same instance under a stable hash ring.
    async fn select_instance(
        &self,
        namespace: &str,
        service: &str,
        hash_key: &str,
    ) -> QuotaResult<Instance>;

    /// Feedback hook so an unhealthy quota server can be circuit-broken out
    /// of the selection ring; see the error handling design's
    /// `callResult=ServerError` path.
    async fn report_call_result(&self, instance: &Instance, success: bool);
}

/// Rule data for one service, as loaded from the control plane.
#[derive(Debug, Clone, Default)]
pub struct ServiceRuleData {
    pub revision: String,
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceDataStatus {
    Found,
    NotFound,
}

/// Supplies rate-limit rule revisions for a service. `get_service_data` may
/// need to wait for an async load the first time a service is referenced;
/// implementations should honor `timeout` rather than blocking forever.
#[async_trait]
pub trait LocalRegistry: Send + Sync {
    async fn get_service_data(
        &self,
        namespace: &str,
        service: &str,
        timeout: Duration,
    ) -> QuotaResult<(ServiceDataStatus, ServiceRuleData)>;

    /// The set of label keys used anywhere in the service's current rules,
    /// used by `FetchRuleLabelKeys` to tell callers what to populate.
    async fn get_rule_label_keys(
        &self,
        namespace: &str,
        service: &str,
        timeout: Duration,
    ) -> QuotaResult<std::collections::BTreeSet<String>>;
}
