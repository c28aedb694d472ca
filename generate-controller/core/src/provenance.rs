//! Records which policy, rule, trigger and source produced a generated
//! resource, as labels on that resource.
//!
//! Generated resources may live in namespaces other than their trigger's, so
//! owner references cannot link them. Labels written here are the only means
//! by which downstream resources are found again.

use crate::k8s::{labels::Selector, policy::AnyPolicy, split_api_version, ResourceSpec};
use std::collections::BTreeMap;

pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kyverno";

pub const POLICY_NAME: &str = "generate.kyverno.io/policy-name";
pub const POLICY_NAMESPACE: &str = "generate.kyverno.io/policy-namespace";
pub const RULE_NAME: &str = "generate.kyverno.io/rule-name";

pub const TRIGGER_GROUP: &str = "generate.kyverno.io/trigger-group";
pub const TRIGGER_VERSION: &str = "generate.kyverno.io/trigger-version";
pub const TRIGGER_KIND: &str = "generate.kyverno.io/trigger-kind";
pub const TRIGGER_NAMESPACE: &str = "generate.kyverno.io/trigger-namespace";
pub const TRIGGER_NAME: &str = "generate.kyverno.io/trigger-name";
pub const TRIGGER_UID: &str = "generate.kyverno.io/trigger-uid";

pub const SOURCE_GROUP: &str = "generate.kyverno.io/source-group";
pub const SOURCE_VERSION: &str = "generate.kyverno.io/source-version";
pub const SOURCE_KIND: &str = "generate.kyverno.io/source-kind";
pub const SOURCE_NAMESPACE: &str = "generate.kyverno.io/source-namespace";
pub const SOURCE_NAME: &str = "generate.kyverno.io/source-name";
pub const SOURCE_UID: &str = "generate.kyverno.io/source-uid";

/// Marks an object that is the source of at least one clone.
pub const CLONE_SOURCE: &str = "generate.kyverno.io/clone-source";

/// Label values are limited to 63 characters.
const MAX_LABEL_VALUE_LEN: usize = 63;

pub type Labels = BTreeMap<String, String>;

/// The identity of a policy rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RuleRef {
    pub policy_name: String,
    pub policy_namespace: String,
    pub rule: String,
}

/// The full provenance of a generated resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Provenance {
    pub rule: RuleRef,
    pub trigger: Option<ResourceSpec>,
    pub source: Option<ResourceSpec>,
}

// === impl RuleRef ===

impl RuleRef {
    pub fn new(policy: &AnyPolicy, rule: impl Into<String>) -> Self {
        Self {
            policy_name: policy.name(),
            policy_namespace: policy.namespace(),
            rule: rule.into(),
        }
    }

    /// The policy key (`namespace/name` or `name`).
    pub fn policy_key(&self) -> String {
        if self.policy_namespace.is_empty() {
            self.policy_name.clone()
        } else {
            format!("{}/{}", self.policy_namespace, self.policy_name)
        }
    }

    fn encode_into(&self, labels: &mut Labels) {
        labels.insert(MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(POLICY_NAME.to_string(), trim(&self.policy_name));
        labels.insert(POLICY_NAMESPACE.to_string(), trim(&self.policy_namespace));
        labels.insert(RULE_NAME.to_string(), trim(&self.rule));
    }

    fn decode(labels: &Labels) -> Option<Self> {
        Some(Self {
            policy_name: labels.get(POLICY_NAME)?.clone(),
            policy_namespace: labels.get(POLICY_NAMESPACE).cloned().unwrap_or_default(),
            rule: labels.get(RULE_NAME)?.clone(),
        })
    }
}

// === impl Provenance ===

impl Provenance {
    pub fn new(rule: RuleRef) -> Self {
        Self {
            rule,
            trigger: None,
            source: None,
        }
    }

    pub fn with_trigger(mut self, trigger: ResourceSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_source(mut self, source: ResourceSpec) -> Self {
        self.source = Some(source);
        self
    }

    pub fn encode(&self) -> Labels {
        let mut labels = Labels::new();
        self.encode_into(&mut labels);
        labels
    }

    /// Adds provenance labels to an existing label set, preserving unrelated
    /// labels.
    pub fn encode_into(&self, labels: &mut Labels) {
        self.rule.encode_into(labels);
        if let Some(trigger) = self.trigger.as_ref() {
            encode_spec(
                labels,
                trigger,
                [
                    TRIGGER_GROUP,
                    TRIGGER_VERSION,
                    TRIGGER_KIND,
                    TRIGGER_NAMESPACE,
                    TRIGGER_NAME,
                    TRIGGER_UID,
                ],
            );
        }
        if let Some(source) = self.source.as_ref() {
            encode_spec(
                labels,
                source,
                [
                    SOURCE_GROUP,
                    SOURCE_VERSION,
                    SOURCE_KIND,
                    SOURCE_NAMESPACE,
                    SOURCE_NAME,
                    SOURCE_UID,
                ],
            );
        }
    }

    /// Recovers provenance from labels. Returns `None` unless the labels
    /// identify a policy rule.
    pub fn decode(labels: &Labels) -> Option<Self> {
        let rule = RuleRef::decode(labels)?;
        let trigger = decode_spec(
            labels,
            [
                TRIGGER_GROUP,
                TRIGGER_VERSION,
                TRIGGER_KIND,
                TRIGGER_NAMESPACE,
                TRIGGER_NAME,
                TRIGGER_UID,
            ],
        );
        let source = decode_spec(
            labels,
            [
                SOURCE_GROUP,
                SOURCE_VERSION,
                SOURCE_KIND,
                SOURCE_NAMESPACE,
                SOURCE_NAME,
                SOURCE_UID,
            ],
        );
        Some(Self {
            rule,
            trigger,
            source,
        })
    }
}

/// Selects every resource generated by a rule.
pub fn rule_selector(rule: &RuleRef) -> Selector {
    let mut labels = Labels::new();
    rule.encode_into(&mut labels);
    Selector::from_map(labels)
}

/// Selects resources generated by a rule for a particular trigger.
pub fn trigger_selector(rule: &RuleRef, trigger: &ResourceSpec) -> Selector {
    let mut labels = Labels::new();
    rule.encode_into(&mut labels);
    let (group, version) = split_api_version(&trigger.api_version);
    labels.insert(TRIGGER_GROUP.to_string(), trim(group));
    labels.insert(TRIGGER_VERSION.to_string(), trim(version));
    labels.insert(TRIGGER_KIND.to_string(), trim(&trigger.kind));
    labels.insert(TRIGGER_NAMESPACE.to_string(), trim(&trigger.namespace));
    if !trigger.uid.is_empty() {
        labels.insert(TRIGGER_UID.to_string(), trim(&trigger.uid));
    } else {
        labels.insert(TRIGGER_NAME.to_string(), trim(&trigger.name));
    }
    Selector::from_map(labels)
}

/// Selects resources generated by a rule from a particular clone source.
pub fn source_selector(rule: &RuleRef, source: &ResourceSpec) -> Selector {
    let mut labels = Labels::new();
    rule.encode_into(&mut labels);
    labels.insert(SOURCE_KIND.to_string(), trim(&source.kind));
    labels.insert(SOURCE_NAMESPACE.to_string(), trim(&source.namespace));
    labels.insert(SOURCE_NAME.to_string(), trim(&source.name));
    Selector::from_map(labels)
}

/// Marks an object as a clone source. Returns true if the labels changed.
pub fn tag_source(labels: &mut Labels) -> bool {
    if labels.get(CLONE_SOURCE).map(String::as_str) == Some("") {
        return false;
    }
    labels.insert(CLONE_SOURCE.to_string(), String::new());
    true
}

/// Returns true for the label keys written by [`Provenance::encode_into`].
pub fn is_provenance_key(key: &str) -> bool {
    key == MANAGED_BY || (key.starts_with("generate.kyverno.io/") && key != CLONE_SOURCE)
}

/// Returns true if the labels mark a resource generated by any policy.
pub fn is_generated(labels: &Labels) -> bool {
    labels.contains_key(POLICY_NAME) && labels.contains_key(RULE_NAME)
}

/// Trims a label value to the maximum length permitted by the API server.
pub fn trim(value: &str) -> String {
    match value.char_indices().nth(MAX_LABEL_VALUE_LEN) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

fn encode_spec(labels: &mut Labels, spec: &ResourceSpec, keys: [&str; 6]) {
    let [group, version, kind, namespace, name, uid] = keys;
    let (g, v) = split_api_version(&spec.api_version);
    labels.insert(group.to_string(), trim(g));
    labels.insert(version.to_string(), trim(v));
    labels.insert(kind.to_string(), trim(&spec.kind));
    labels.insert(namespace.to_string(), trim(&spec.namespace));
    labels.insert(name.to_string(), trim(&spec.name));
    labels.insert(uid.to_string(), trim(&spec.uid));
}

fn decode_spec(labels: &Labels, keys: [&str; 6]) -> Option<ResourceSpec> {
    let [group, version, kind, namespace, name, uid] = keys;
    let kind = labels.get(kind)?.clone();
    let version = labels.get(version).cloned().unwrap_or_default();
    let group = labels.get(group).cloned().unwrap_or_default();
    let api_version = if group.is_empty() {
        version
    } else {
        format!("{group}/{version}")
    };
    Some(ResourceSpec {
        api_version,
        kind,
        namespace: labels.get(namespace).cloned().unwrap_or_default(),
        name: labels.get(name).cloned().unwrap_or_default(),
        uid: labels.get(uid).cloned().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{labels::Labels as SelectorLabels, ClusterPolicy, Policy};
    use pretty_assertions::assert_eq;

    fn rule() -> RuleRef {
        RuleRef {
            policy_name: "add-networkpolicy".to_string(),
            policy_namespace: String::new(),
            rule: "default-deny".to_string(),
        }
    }

    #[test]
    fn rule_ref_from_policy() {
        let mut policy = Policy::new("ns-policy", Default::default());
        policy.metadata.namespace = Some("production".to_string());
        let rule = RuleRef::new(&policy.into(), "validate-annotations");
        assert_eq!(rule.policy_name, "ns-policy");
        assert_eq!(rule.policy_namespace, "production");
        assert_eq!(rule.policy_key(), "production/ns-policy");

        let rule = RuleRef::new(&ClusterPolicy::new("p", Default::default()).into(), "r");
        assert_eq!(rule.policy_namespace, "");
        assert_eq!(rule.policy_key(), "p");
    }

    #[test]
    fn encodes_trigger_group_and_version() {
        let trigger =
            ResourceSpec::new("apps/v1", "Deployment", "production", "my-app").with_uid("u-456");
        let labels = Provenance::new(rule()).with_trigger(trigger).encode();
        assert_eq!(labels[MANAGED_BY], "kyverno");
        assert_eq!(labels[TRIGGER_GROUP], "apps");
        assert_eq!(labels[TRIGGER_VERSION], "v1");
        assert_eq!(labels[TRIGGER_KIND], "Deployment");
        assert_eq!(labels[TRIGGER_NAMESPACE], "production");
        assert_eq!(labels[TRIGGER_UID], "u-456");

        let trigger = ResourceSpec::new("v1", "Namespace", "", "new-namespace");
        let labels = Provenance::new(rule()).with_trigger(trigger).encode();
        assert_eq!(labels[TRIGGER_GROUP], "");
        assert_eq!(labels[TRIGGER_NAMESPACE], "");
    }

    #[test]
    fn round_trip() {
        let prov = Provenance::new(rule())
            .with_trigger(ResourceSpec::new("v1", "Pod", "default", "test-pod").with_uid("pod-uid"))
            .with_source(ResourceSpec::new("v1", "Secret", "default", "regcred").with_uid("s-uid"));
        let labels = prov.encode();
        assert_eq!(Provenance::decode(&labels), Some(prov));
    }

    #[test]
    fn decode_requires_rule() {
        let labels = maplit::btreemap! {
            TRIGGER_KIND.to_string() => "Pod".to_string(),
        };
        assert_eq!(Provenance::decode(&labels), None);
    }

    #[test]
    fn trims_long_values() {
        let name = "x".repeat(100);
        let labels = Provenance::new(rule())
            .with_trigger(ResourceSpec::new("v1", "Pod", "default", name))
            .encode();
        assert_eq!(labels[TRIGGER_NAME].len(), 63);
        assert_eq!(trim("short"), "short");
    }

    #[test]
    fn encode_preserves_existing_labels() {
        let mut labels = maplit::btreemap! {
            "app".to_string() => "my-app".to_string(),
        };
        Provenance::new(rule()).encode_into(&mut labels);
        assert_eq!(labels["app"], "my-app");
        assert_eq!(labels[POLICY_NAME], "add-networkpolicy");
        assert!(is_generated(&labels));
    }

    #[test]
    fn selectors_match_encoded_labels() {
        let trigger = ResourceSpec::new("v1", "Namespace", "", "team-a").with_uid("ns-uid");
        let source = ResourceSpec::new("v1", "Secret", "default", "regcred");
        let labels: SelectorLabels = Provenance::new(rule())
            .with_trigger(trigger.clone())
            .with_source(source.clone())
            .encode()
            .into();

        assert!(rule_selector(&rule()).matches(&labels));
        assert!(trigger_selector(&rule(), &trigger).matches(&labels));
        assert!(source_selector(&rule(), &source).matches(&labels));

        let other = RuleRef {
            rule: "other".to_string(),
            ..rule()
        };
        assert!(!rule_selector(&other).matches(&labels));
        let other_trigger = ResourceSpec::new("v1", "Namespace", "", "team-b").with_uid("other");
        assert!(!trigger_selector(&rule(), &other_trigger).matches(&labels));
    }

    #[test]
    fn provenance_keys() {
        let labels = Provenance::new(rule())
            .with_trigger(ResourceSpec::new("v1", "Pod", "default", "p"))
            .with_source(ResourceSpec::new("v1", "Secret", "default", "s"))
            .encode();
        assert!(labels.keys().all(|k| is_provenance_key(k)));
        assert!(!is_provenance_key(CLONE_SOURCE));
        assert!(!is_provenance_key("app"));
    }

    #[test]
    fn tag_source_is_idempotent() {
        let mut labels = Labels::new();
        assert!(tag_source(&mut labels));
        assert!(labels.contains_key(CLONE_SOURCE));
        assert!(!tag_source(&mut labels));
    }
}
