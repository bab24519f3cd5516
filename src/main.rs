//! Demo binary: wires a `QuotaManager` to the crate's in-memory fakes and
//! fires a scripted burst of `GetQuota` calls so the climb adjuster and
//! remote-sync paths have something to react to. Not meant to be a
//! production entry point — a real embedder links the library and supplies
//! its own `ServiceResolver`/`LocalRegistry`/`StreamClient`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meshrate::adjuster::climb::ClimbConfig;
use meshrate::config::render_config;
use meshrate::model::{
    Action, Amount, AmountMode, FailoverType, MatcherSet, RateLimitRule, Resource, ReportConfig,
    RuleId, RuleType,
};
use meshrate::registry::Instance;
use meshrate::testing::{FakeQuotaServer, FixedResolver, StaticRegistry};
use meshrate::{Mode, QuotaManager, Reactor};

fn demo_rule(mode: Mode) -> RateLimitRule {
    RateLimitRule {
        id: RuleId {
            namespace: "default".into(),
            service: "orders".into(),
            rule_id: "demo-rule".into(),
            revision: "1".into(),
        },
        priority: 0,
        resource: Resource::Qps,
        rule_type: if mode == Mode::Global { RuleType::Global } else { RuleType::Local },
        amount_mode: AmountMode::GlobalTotal,
        action: Action::Reject,
        labels: MatcherSet::default(),
        subset: MatcherSet::default(),
        amounts: vec![Amount {
            max_amount: 20,
            valid_duration: Duration::from_secs(1),
            precision: 100,
            start_amount: 5,
            end_amount: 40,
            min_amount: 2,
        }],
        report: ReportConfig { interval: Duration::from_secs(1), batch: false },
        adjuster: Some(ClimbConfig::default()),
        failover: FailoverType::FailoverLocal,
        cluster_override: None,
        disable: false,
    }
}

fn main() {
    let config = render_config();

    let reactor = Reactor::spawn_owned();
    let registry = Arc::new(StaticRegistry::new());
    let rule = demo_rule(config.manager_config().mode);
    registry.set_rules("default", "orders", "1", vec![rule]);

    let fake_addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let resolver = Arc::new(FixedResolver::new(fake_addr));
    let server = FakeQuotaServer::new();
    let client_factory: meshrate::connector::StreamClientFactory = Arc::new({
        let server = server.clone();
        move |_instance: &Instance| -> Arc<dyn meshrate::connector::StreamClient> { server.clone() }
    });

    let manager = QuotaManager::new(reactor.clone(), registry, resolver, client_factory, config.manager_config());
    manager.start();

    // A runtime of our own to drive this scripted loop; the reactor drives
    // its own window/connection state on its dedicated thread regardless of
    // which runtime the caller happens to await `get_quota` from.
    let driver = tokio::runtime::Runtime::new().expect("failed to build demo runtime");
    driver.block_on(async {
        let labels = BTreeMap::new();
        let subset = BTreeMap::new();
        for i in 0..30 {
            match manager
                .get_quota("default", "orders", &labels, &subset, 1, Duration::from_millis(200))
                .await
            {
                Ok(resp) => tracing::info!(call = i, result = ?resp.result, left = resp.left_quota, "get_quota"),
                Err(err) => tracing::warn!(call = i, error = %err, "get_quota failed"),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    reactor.stop();
}
