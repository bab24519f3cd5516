//! Configuration sourced from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitToml {
    pub enable: Option<bool>,
    pub mode: Option<String>,
    pub rate_limit_cluster: Option<ClusterToml>,
    pub message_timeout: Option<u64>,
    pub lru_size: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterToml {
    pub namespace: String,
    pub service: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LoggingToml {
    pub level: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Toml {
    pub rate_limit: RateLimitToml,
    pub logging: LoggingToml,
}

impl Toml {
    pub fn from_path<P>(path: &P) -> Self
    where
        P: AsRef<Path> + core::fmt::Debug + ?Sized,
    {
        tracing::info!("Loading TOML from {path:?}");
        let f = std::fs::read_to_string(path).unwrap_or_else(|_| panic!("Failed to load file at {path:?}"));
        let t = ::toml::from_str(&f).expect("failed to deserialize");
        tracing::info!("TOML file contents: {t:?}");
        t
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_rate_limit_table() {
        let raw = r#"
            [rateLimit]
            enable = true
            mode = "global"
            messageTimeout = 2000
            lruSize = 4096

            [rateLimit.rateLimitCluster]
            namespace = "polaris"
            service = "ratelimit"

            [logging]
            level = "debug"
        "#;
        let t: Toml = ::toml::from_str(raw).unwrap();
        assert_eq!(t.rate_limit.enable, Some(true));
        assert_eq!(t.rate_limit.mode.as_deref(), Some("global"));
        assert_eq!(t.rate_limit.message_timeout, Some(2000));
        assert_eq!(t.rate_limit.lru_size, Some(4096));
        assert_eq!(
            t.rate_limit.rate_limit_cluster,
            Some(ClusterToml { namespace: "polaris".into(), service: "ratelimit".into() })
        );
        assert_eq!(t.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let t: Toml = ::toml::from_str("").unwrap();
        assert_eq!(t, Toml::default());
    }
}
