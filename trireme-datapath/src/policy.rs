use trireme_packet::Direction;

use crate::tag::TagStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
    Encrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveAction {
    None,
    Apply,
    ApplyContinue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowPolicy {
    pub action: Action,
    pub policy_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPolicy {
    pub action: Action,
    pub policy_id: String,
    pub observe: ObserveAction,
    pub shadow: Option<ShadowPolicy>,
}

impl FlowPolicy {
    pub fn accept_all() -> Self {
        FlowPolicy { action: Action::Accept, policy_id: "allow-all".to_string(), observe: ObserveAction::None, shadow: None }
    }

    fn default_deny(shadow: Option<ShadowPolicy>) -> Self {
        FlowPolicy { action: Action::Reject, policy_id: "default-deny".to_string(), observe: ObserveAction::None, shadow }
    }
}

/// A rule matches when every tag in its selector is present (by exact
/// key=value match) in the peer's tag store. Rules are scanned in
/// insertion order; the first match wins except for `ApplyContinue`, which
/// records a shadow verdict and keeps scanning.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub policy_id: String,
    pub selector: Vec<(String, String)>,
    pub action: Action,
    pub observe: ObserveAction,
}

impl PolicyRule {
    pub fn new(policy_id: impl Into<String>, action: Action) -> Self {
        PolicyRule { policy_id: policy_id.into(), selector: Vec::new(), action, observe: ObserveAction::None }
    }

    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector.push((key.into(), value.into()));
        self
    }

    pub fn with_observe(mut self, observe: ObserveAction) -> Self {
        self.observe = observe;
        self
    }

    fn matches(&self, peer_tags: &TagStore) -> bool {
        self.selector.iter().all(|(k, v)| peer_tags.contains(k, v))
    }
}

/// The per-PU policy database. `allow_all` mirrors the Go source's
/// `AllowAll` policy: it short-circuits evaluation entirely, without
/// scanning `rules`, and is also observable at Enforce time (see
/// `pu.rs::PuRegistry::enforce`).
#[derive(Debug, Clone, Default)]
pub struct PolicyDb {
    pub rules: Vec<PolicyRule>,
    pub allow_all: bool,
}

impl PolicyDb {
    pub fn new() -> Self {
        PolicyDb::default()
    }

    pub fn with_allow_all() -> Self {
        PolicyDb { rules: Vec::new(), allow_all: true }
    }

    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        PolicyDb { rules, allow_all: false }
    }

    /// Evaluates the policy for one flow. `direction` picks which side's
    /// tags are matched against the rule selectors: an app-originated flow
    /// is judged by what the destination advertises, a network-originated
    /// one by what the source advertises — the peer's identity, not our
    /// own.
    pub fn evaluate(&self, source: &TagStore, destination: &TagStore, direction: Direction) -> FlowPolicy {
        if self.allow_all {
            return FlowPolicy::accept_all();
        }
        let peer = match direction {
            Direction::AppOriginated => destination,
            Direction::NetworkOriginated => source,
        };

        let mut shadow: Option<ShadowPolicy> = None;
        for rule in &self.rules {
            if !rule.matches(peer) {
                continue;
            }
            if rule.observe == ObserveAction::ApplyContinue {
                if shadow.is_none() {
                    shadow = Some(ShadowPolicy { action: rule.action, policy_id: rule.policy_id.clone() });
                }
                continue;
            }
            return FlowPolicy { action: rule.action, policy_id: rule.policy_id.clone(), observe: rule.observe, shadow };
        }
        FlowPolicy::default_deny(shadow)
    }
}
