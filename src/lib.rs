//! Client-side distributed rate-limiting core for a service-mesh sidecar.
//!
//! A process embedding this crate gets local token buckets that can
//! optionally sync their residual quota against a remote quota service, so
//! a limit configured once ("100 req/s for this route") holds across every
//! client sharing it rather than per-process. See [`QuotaManager`] for the
//! entry point.
//!
//! This crate does not ship service discovery, a control-plane client, or a
//! gRPC transport — those are external collaborators behind the
//! [`registry::ServiceResolver`]/[`registry::LocalRegistry`]/
//! [`connector::StreamClient`] trait boundaries. See [`testing`] for
//! in-memory fakes suitable for embedding tests.

pub mod adjuster;
pub mod bucket;
pub mod config;
pub mod connector;
pub mod error;
pub mod manager;
pub mod model;
pub mod reactor;
pub mod recorder;
pub mod registry;
pub mod window;

pub mod testing;

pub use error::{QuotaError, QuotaResult};
pub use manager::{Mode, QuotaManager, QuotaResponse};
pub use model::{
    Action, Amount, AmountMode, FailoverType, MatchValue, MatcherSet, RateLimitRule, Resource,
    RuleId, RuleType,
};
pub use reactor::Reactor;
