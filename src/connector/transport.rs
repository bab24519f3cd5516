//! The `StreamClient` trait boundary standing in for the real HTTP/2+gRPC
//! transport (`/polaris.metric.v2.RateLimitGRPCV2/Service`,
//! `.../TimeAdjust`, and the metric service's `Init`/`Query`/`Report`
//! paths). This crate does not ship a gRPC codec — that is an external
//! collaborator, like `ServiceResolver`/`LocalRegistry` — but the message
//! shapes below are bit-compatible with the control-plane wire protocol so
//! a production implementation only has to serialize/deserialize, not
//! redesign.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QuotaResult;
use crate::model::RuleId;

/// `LimitTarget{namespace, service, labels}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitTarget {
    pub namespace: String,
    pub service: String,
    pub canonical_labels: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaMode {
    Whole,
    Divide,
}

/// `QuotaTotal{maxAmount, durationSeconds, mode}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaTotal {
    pub max_amount: i64,
    pub duration_ms: u64,
    pub mode: QuotaMode,
}

/// `QuotaCounter{counterKey, duration, left, clientCount}` — server's init
/// response for one amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCounter {
    pub counter_key: u32,
    pub duration_ms: u64,
    pub left: i64,
    pub client_count: u32,
}

/// `QuotaSum{used, limited, counterKey}` — one report line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSum {
    pub counter_key: u32,
    pub used: u64,
    pub limited: u64,
}

/// `QuotaLeft{counterKey, left}` — one report-response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLeft {
    pub counter_key: u32,
    pub left: i64,
}

#[derive(Debug, Clone)]
pub struct InitRequest {
    pub target: LimitTarget,
    pub rule_id: RuleId,
    pub totals: Vec<QuotaTotal>,
}

#[derive(Debug, Clone)]
pub struct InitResponse {
    pub client_key: u64,
    pub counters: Vec<QuotaCounter>,
}

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub client_key: u64,
    pub sums: Vec<QuotaSum>,
}

#[derive(Debug, Clone)]
pub struct ReportResponse {
    pub lefts: Vec<QuotaLeft>,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeAdjustResponse {
    /// Server wall-clock timestamp at the moment it handled the request.
    pub server_timestamp_ms: i64,
}

/// A single long-lived duplex stream to one quota-server (or metric
/// service) instance. One [`crate::connector::connection::Connection`]
/// owns exactly one `StreamClient`.
///
/// Implementations are expected to be cheap to construct per-connection and
/// to surface transport failures as `Err` rather than panicking — the
/// connector treats any error uniformly as a connection-closing event (see
/// the failure-handling rules in the connector's module docs).
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Unary `TimeAdjust` RPC, issued once after connecting and every 60s.
    async fn time_adjust(&self, timeout: Duration) -> QuotaResult<TimeAdjustResponse>;

    /// Bidi-stream init call for one window's first sync.
    async fn init(&self, req: InitRequest, timeout: Duration) -> QuotaResult<InitResponse>;

    /// Bidi-stream report call, batching one or more windows' usage.
    async fn report(&self, req: ReportRequest, timeout: Duration) -> QuotaResult<ReportResponse>;
}
