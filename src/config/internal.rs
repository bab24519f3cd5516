//! The *actual* internal configuration structure.
//!
//! Used only internally, and never exposed directly as the CLI, env, or TOML
//! surface — this is the buffer between those external, stable shapes and
//! whatever the rest of the crate actually needs, which may change freely.

use std::time::Duration;

use crate::manager::{ManagerConfig, Mode};

/// meshrate's internal configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub validate_configs: bool,
    pub log_level: String,
    pub enable: bool,
    pub mode: Mode,
    pub rate_limit_cluster: Option<(String, String)>,
    pub message_timeout_ms: u64,
    pub lru_size: usize,
    pub clear_expired_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            validate_configs: false,
            log_level: String::from("info"),
            enable: true,
            mode: Mode::Local,
            rate_limit_cluster: None,
            message_timeout_ms: 1_000,
            lru_size: 0,
            clear_expired_interval_ms: 10_000,
        }
    }
}

impl Config {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            enable: self.enable,
            mode: self.mode,
            rate_limit_cluster: self.rate_limit_cluster.clone(),
            message_timeout: Duration::from_millis(self.message_timeout_ms),
            lru_size: self.lru_size,
            clear_expired_interval: Duration::from_millis(self.clear_expired_interval_ms),
        }
    }

    pub fn validate(&self) {
        assert!(self.message_timeout_ms > 0, "rateLimit.messageTimeout must be positive");
        if let Some((ns, svc)) = &self.rate_limit_cluster {
            assert!(!ns.is_empty() && !svc.is_empty(), "rateLimit.rateLimitCluster must name both namespace and service when set");
        }
    }
}
