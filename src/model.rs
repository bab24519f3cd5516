//! The rate-limit data model: rules, amounts, matchers, and the canonical
//! keys used to index rate-limit windows.
//!
//! Rules are immutable once loaded from the [`crate::registry::LocalRegistry`];
//! everything here is `Clone` so a rule can be shared across windows without
//! re-fetching it from the registry on every request.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;

use crate::error::{QuotaError, QuotaResult};

/// Coarse resource kind a rule applies to. `QPS` is the only resource this
/// core understands; the field exists so rule documents from the control
/// plane that carry other resource kinds can be recognised and skipped by
/// the matcher instead of misinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Qps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Local,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountMode {
    GlobalTotal,
    ShareEqually,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Reject,
    Unirate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverType {
    FailoverLocal,
    FailoverPass,
}

/// A single matcher against one label or subset key.
///
/// `Regex` and `Variable`/`Parameter` matchers both need to be rendered to a
/// stable string when computing a [`RateLimitWindowKey`], since two requests
/// with the same concrete label value should land in the same window
/// regardless of which matcher kind admitted them.
#[derive(Debug, Clone)]
pub enum MatchValue {
    Exact(String),
    Regex(Regex),
    /// Matches any value and binds it under `name` for canonicalisation —
    /// used for both `variable` and `parameter` matcher kinds, which differ
    /// only in how the control plane documents intent, not in match logic.
    Variable { name: String },
}

impl PartialEq for MatchValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (Self::Variable { name: a }, Self::Variable { name: b }) => a == b,
            _ => false,
        }
    }
}

impl MatchValue {
    fn matches(&self, value: &str) -> bool {
        match self {
            MatchValue::Exact(expect) => expect == value,
            MatchValue::Regex(re) => re.is_match(value),
            MatchValue::Variable { .. } => true,
        }
    }

    /// A stable string for this matcher given the concrete observed value.
    /// Exact matchers render as the rule-defined literal (every request that
    /// matched shares the same window); regex/variable matchers render the
    /// concrete value so windows are keyed on what was actually seen.
    fn canonical(&self, observed: &str) -> String {
        match self {
            MatchValue::Exact(expect) => expect.clone(),
            MatchValue::Regex(_) | MatchValue::Variable { .. } => observed.to_string(),
        }
    }
}

/// An ordered set of key/[`MatchValue`] pairs, e.g. rule labels or subset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatcherSet {
    entries: Vec<(String, MatchValue)>,
}

impl MatcherSet {
    pub fn new(entries: Vec<(String, MatchValue)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The label/subset keys this set matches on, in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Returns `true` iff every matcher in this set finds a matching key in
    /// `observed`. An empty matcher set always matches (a rule with no
    /// labels/subset applies unconditionally).
    pub fn matches(&self, observed: &BTreeMap<String, String>) -> bool {
        self.entries.iter().all(|(key, matcher)| {
            observed
                .get(key)
                .map(|v| matcher.matches(v))
                .unwrap_or(false)
        })
    }

    /// Render a stable, sort-order-independent string identifying this
    /// matcher set against the concrete `observed` values. Keys are sorted
    /// so that two requests carrying the same labels in different insertion
    /// or map-iteration order still canonicalise to the same string —
    /// this is what lets `regex`/`variable` matchers share a window.
    pub fn canonicalize(&self, observed: &BTreeMap<String, String>) -> String {
        let mut rendered: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|(key, matcher)| {
                let observed_val = observed.get(key).map(String::as_str).unwrap_or("");
                (key.clone(), matcher.canonical(observed_val))
            })
            .collect();
        rendered.sort_by(|a, b| a.0.cmp(&b.0));
        rendered
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// `{maxAmount, validDuration, precision, startAmount, endAmount, minAmount}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Amount {
    /// Total budget per window when `GLOBAL_TOTAL`, per-instance share otherwise.
    pub max_amount: i64,
    /// Calendar-aligned window length. Must be at least one second.
    pub valid_duration: Duration,
    /// Climb-adjuster ring precision (bucket count) for this amount's metrics.
    pub precision: u32,
    /// Soft floor used by the climb adjuster.
    pub start_amount: i64,
    /// Hard ceiling the climb adjuster will never exceed.
    pub end_amount: i64,
    /// Hard floor the climb adjuster will never go below.
    pub min_amount: i64,
}

impl Amount {
    pub fn validate(&self) -> QuotaResult<()> {
        if self.valid_duration < Duration::from_secs(1) {
            return Err(QuotaError::InvalidConfig(
                "amount.valid_duration must be >= 1s".into(),
            ));
        }
        if self.max_amount < 0 {
            return Err(QuotaError::InvalidConfig(
                "amount.max_amount must be >= 0".into(),
            ));
        }
        if self.min_amount > self.end_amount {
            return Err(QuotaError::InvalidConfig(
                "amount.min_amount must be <= end_amount".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportConfig {
    pub interval: Duration,
    pub batch: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch: false,
        }
    }
}

/// Identifies one rate-limit rule document, independent of its contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId {
    pub namespace: String,
    pub service: String,
    pub rule_id: String,
    pub revision: String,
}

/// An immutable, fully-parsed rate-limit rule.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub id: RuleId,
    /// Lower is preferred when multiple rules match the same request.
    pub priority: i32,
    pub resource: Resource,
    pub rule_type: RuleType,
    pub amount_mode: AmountMode,
    pub action: Action,
    pub labels: MatcherSet,
    pub subset: MatcherSet,
    /// Non-empty; all amounts must pass for an `Allocate` to succeed.
    pub amounts: Vec<Amount>,
    pub report: ReportConfig,
    pub adjuster: Option<crate::adjuster::climb::ClimbConfig>,
    pub failover: FailoverType,
    /// Overrides the global rate-limit cluster for this rule, if set.
    pub cluster_override: Option<(String, String)>,
    pub disable: bool,
}

impl RateLimitRule {
    pub fn validate(&self) -> QuotaResult<()> {
        if self.amounts.is_empty() {
            return Err(QuotaError::InvalidConfig(
                "rule must declare at least one amount".into(),
            ));
        }
        for amount in &self.amounts {
            amount.validate()?;
        }
        Ok(())
    }

    /// `rule.service + "#" + canonicalLabels` — used both as the consistent
    /// hash key for server selection and as the window's identifier inside
    /// the quota server.
    pub fn metric_id(&self, canonical_labels: &str) -> String {
        format!("{}#{}", self.id.service, canonical_labels)
    }

    /// Amounts sorted by ascending duration, as `Allocate` must evaluate
    /// token buckets shortest-window-first.
    pub fn amounts_by_duration(&self) -> Vec<&Amount> {
        let mut out: Vec<&Amount> = self.amounts.iter().collect();
        out.sort_by_key(|a| a.valid_duration);
        out
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>, subset: &BTreeMap<String, String>) -> bool {
        !self.disable && self.labels.matches(labels) && self.subset.matches(subset)
    }
}

/// `{ruleId, canonicalLabels, canonicalSubset}` — uniquely identifies a
/// rate-limit window. Two concrete requests that match the same rule and
/// canonicalise to the same labels/subset share exactly one window.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RateLimitWindowKey {
    pub rule_id: RuleId,
    pub canonical_labels: String,
    pub canonical_subset: String,
}

impl RateLimitWindowKey {
    pub fn new(
        rule: &RateLimitRule,
        labels: &BTreeMap<String, String>,
        subset: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            rule_id: rule.id.clone(),
            canonical_labels: rule.labels.canonicalize(labels),
            canonical_subset: rule.subset.canonicalize(subset),
        }
    }
}

/// Given a rule and the set of candidate rules for a service, pick the
/// highest-priority (lowest `priority` value) non-disabled rule whose
/// labels and subset match the observed request.
pub fn match_rule<'a>(
    rules: &'a [RateLimitRule],
    labels: &BTreeMap<String, String>,
    subset: &BTreeMap<String, String>,
) -> Option<&'a RateLimitRule> {
    rules
        .iter()
        .filter(|r| r.matches(labels, subset))
        .min_by_key(|r| r.priority)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule(priority: i32, disabled: bool) -> RateLimitRule {
        RateLimitRule {
            id: RuleId {
                namespace: "ns".into(),
                service: "svc".into(),
                rule_id: format!("r{priority}"),
                revision: "1".into(),
            },
            priority,
            resource: Resource::Qps,
            rule_type: RuleType::Local,
            amount_mode: AmountMode::GlobalTotal,
            action: Action::Reject,
            labels: MatcherSet::default(),
            subset: MatcherSet::default(),
            amounts: vec![Amount {
                max_amount: 10,
                valid_duration: Duration::from_secs(1),
                precision: 100,
                start_amount: 0,
                end_amount: 10,
                min_amount: 0,
            }],
            report: ReportConfig::default(),
            adjuster: None,
            failover: FailoverType::FailoverLocal,
            cluster_override: None,
            disable: disabled,
        }
    }

    #[test]
    fn picks_lowest_priority_non_disabled() {
        let rules = vec![rule(5, false), rule(1, true), rule(2, false)];
        let matched = match_rule(&rules, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(matched.id.rule_id, "r2");
    }

    #[test]
    fn regex_and_exact_canonicalize_stably() {
        let labels = MatcherSet::new(vec![
            ("env".into(), MatchValue::Exact("prod".into())),
            (
                "uid".into(),
                MatchValue::Regex(Regex::new("^u-[0-9]+$").unwrap()),
            ),
        ]);
        let mut observed_a = BTreeMap::new();
        observed_a.insert("env".to_string(), "prod".to_string());
        observed_a.insert("uid".to_string(), "u-42".to_string());

        let mut observed_b = BTreeMap::new();
        observed_b.insert("uid".to_string(), "u-42".to_string());
        observed_b.insert("env".to_string(), "prod".to_string());

        assert!(labels.matches(&observed_a));
        assert_eq!(labels.canonicalize(&observed_a), labels.canonicalize(&observed_b));
    }
}
