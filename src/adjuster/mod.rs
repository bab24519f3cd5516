//! Call-metric collection, health evaluation, and the climb finite-state
//! tuner that together form a window's optional adaptive adjuster.

pub mod call_metric;
pub mod climb;
pub mod health;

pub use call_metric::{CallMetricRing, CallResultType, MetricSnapshot, SpecialErrorType};
pub use climb::{ClimbAdjuster, ClimbConfig, ThresholdChange, TuneReason};
pub use health::{evaluate, evaluate_special, Health, HealthThresholds};
