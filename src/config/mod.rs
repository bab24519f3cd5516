pub mod cli;
pub mod internal;
pub mod toml;

use clap::Parser;

use cli::Cli;
use toml::Toml;

use crate::manager::Mode;

/// Parses CLI flags, layers a TOML file's settings on top of the defaults,
/// then re-applies CLI flags on top of that, and initializes `tracing`
/// logging at the resolved level.
///
/// Priority, highest first: CLI flags > configuration file > built-in
/// defaults.
pub fn render_config() -> internal::Config {
    let mut config = internal::Config::default();

    let c = Cli::parse();

    let toml_opts = c.config_toml.as_ref().map(Toml::from_path);
    if let Some(t) = &toml_opts {
        apply_toml(&mut config, t);
    }
    apply_cli(&mut config, &c);

    init_logging(&config.log_level);
    tracing::info!(?config, "resolved configuration");

    if config.validate_configs {
        config.validate();
    }
    config
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn apply_cli(conf: &mut internal::Config, cli: &Cli) {
    let Cli { validate_configs, config_toml: _, lru_size } = cli;

    conf.validate_configs |= validate_configs;
    if let Some(n) = lru_size {
        conf.lru_size = *n;
    }
}

fn apply_toml(conf: &mut internal::Config, toml: &Toml) {
    let Toml { rate_limit, logging } = toml;

    if let Some(enable) = rate_limit.enable {
        conf.enable = enable;
    }
    if let Some(mode) = &rate_limit.mode {
        conf.mode = match mode.as_str() {
            "global" => Mode::Global,
            "local" => Mode::Local,
            other => panic!("unknown rateLimit.mode {other:?}, expected \"local\" or \"global\""),
        };
    }
    if let Some(cluster) = &rate_limit.rate_limit_cluster {
        conf.rate_limit_cluster = Some((cluster.namespace.clone(), cluster.service.clone()));
    }
    if let Some(timeout) = rate_limit.message_timeout {
        conf.message_timeout_ms = timeout;
    }
    if let Some(lru) = rate_limit.lru_size {
        conf.lru_size = lru;
    }
    if let Some(level) = &logging.level {
        conf.log_level = level.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn toml_layer_overrides_defaults_and_cli_overrides_toml() {
        let mut conf = internal::Config::default();
        let t = Toml {
            rate_limit: toml::RateLimitToml {
                enable: Some(true),
                mode: Some("global".into()),
                rate_limit_cluster: Some(toml::ClusterToml { namespace: "ns".into(), service: "svc".into() }),
                message_timeout: Some(5_000),
                lru_size: Some(128),
            },
            logging: toml::LoggingToml { level: Some("debug".into()) },
        };
        apply_toml(&mut conf, &t);
        assert_eq!(conf.mode, Mode::Global);
        assert_eq!(conf.lru_size, 128);
        assert_eq!(conf.log_level, "debug");

        let cli = Cli { validate_configs: true, config_toml: None, lru_size: Some(4096) };
        apply_cli(&mut conf, &cli);
        assert!(conf.validate_configs);
        assert_eq!(conf.lru_size, 4096);
        // Untouched by CLI, TOML value survives.
        assert_eq!(conf.mode, Mode::Global);
    }
}
