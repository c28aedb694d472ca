use crate::{labels, ResourceSpec};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A namespaced set of rules. Only the parts consumed by background generation
/// are modeled.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kyverno.io",
    version = "v1",
    kind = "Policy",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_rules: Option<ApplyRules>,

    #[serde(default)]
    pub use_server_side_apply: bool,
}

/// The cluster-scoped counterpart of [`Policy`].
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kyverno.io",
    version = "v1",
    kind = "ClusterPolicy",
    derive = "PartialEq"
)]
pub struct ClusterPolicySpec {
    #[serde(flatten)]
    pub policy: PolicySpec,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ApplyRules {
    #[default]
    All,
    One,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,

    /// Resource selection, interpreted by the evaluation engine.
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_resources: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<Generation>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<Variable>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Describes how downstream resources are generated and kept in sync.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    #[serde(default)]
    pub generate_existing: bool,

    #[serde(default)]
    pub synchronize: bool,

    #[serde(default)]
    pub orphan_downstream_on_policy_delete: bool,

    #[serde(flatten)]
    pub pattern: GeneratePattern,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreach: Vec<ForEachGeneration>,
}

/// The target of a generation together with where its content comes from.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePattern {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneFrom>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_list: Option<CloneList>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForEachGeneration {
    /// An expression evaluating to the list of elements to iterate over.
    pub list: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextEntry>,

    #[serde(flatten)]
    pub pattern: GeneratePattern,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloneFrom {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloneList {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<labels::Selector>,
}

/// Either a [`Policy`] or a [`ClusterPolicy`].
#[derive(Clone, Debug, PartialEq)]
pub enum AnyPolicy {
    Namespaced(Policy),
    Cluster(ClusterPolicy),
}

// === impl GeneratePattern ===

impl GeneratePattern {
    /// The declared target of this pattern.
    pub fn target(&self) -> ResourceSpec {
        ResourceSpec::new(
            self.api_version.clone(),
            self.kind.clone(),
            self.namespace.clone(),
            self.name.clone(),
        )
    }
}

// === impl Rule ===

impl Rule {
    pub fn has_generate(&self) -> bool {
        self.generate.is_some()
    }
}

// === impl AnyPolicy ===

impl AnyPolicy {
    pub fn name(&self) -> String {
        match self {
            Self::Namespaced(p) => p.name_any(),
            Self::Cluster(p) => p.name_any(),
        }
    }

    /// The namespace of a namespaced policy; empty for cluster policies.
    pub fn namespace(&self) -> String {
        match self {
            Self::Namespaced(p) => p.namespace().unwrap_or_default(),
            Self::Cluster(_) => String::new(),
        }
    }

    /// The key under which the policy is referenced by update requests:
    /// `namespace/name` for namespaced policies, `name` otherwise.
    pub fn key(&self) -> String {
        match self {
            Self::Namespaced(_) => format!("{}/{}", self.namespace(), self.name()),
            Self::Cluster(_) => self.name(),
        }
    }

    pub fn is_namespaced(&self) -> bool {
        matches!(self, Self::Namespaced(_))
    }

    /// True once deletion of the policy has been requested.
    pub fn is_terminating(&self) -> bool {
        match self {
            Self::Namespaced(p) => p.meta().deletion_timestamp.is_some(),
            Self::Cluster(p) => p.meta().deletion_timestamp.is_some(),
        }
    }

    pub fn spec(&self) -> &PolicySpec {
        match self {
            Self::Namespaced(p) => &p.spec,
            Self::Cluster(p) => &p.spec.policy,
        }
    }

    fn spec_mut(&mut self) -> &mut PolicySpec {
        match self {
            Self::Namespaced(p) => &mut p.spec,
            Self::Cluster(p) => &mut p.spec.policy,
        }
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.spec().rules.iter().find(|r| r.name == name)
    }

    /// Returns a copy of this policy retaining only the named rule, or `None`
    /// if no such rule exists.
    pub fn with_only_rule(&self, name: &str) -> Option<Self> {
        let rule = self.rule(name)?.clone();
        let mut policy = self.clone();
        policy.spec_mut().rules = vec![rule];
        Some(policy)
    }

    pub fn object_ref(&self) -> ObjectReference {
        match self {
            Self::Namespaced(p) => p.object_ref(&()),
            Self::Cluster(p) => p.object_ref(&()),
        }
    }
}

impl From<Policy> for AnyPolicy {
    fn from(policy: Policy) -> Self {
        Self::Namespaced(policy)
    }
}

impl From<ClusterPolicy> for AnyPolicy {
    fn from(policy: ClusterPolicy) -> Self {
        Self::Cluster(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize_clone_rule() {
        let policy: ClusterPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "kyverno.io/v1",
            "kind": "ClusterPolicy",
            "metadata": { "name": "sync-secrets" },
            "spec": {
                "applyRules": "One",
                "rules": [{
                    "name": "sync-image-pull-secret",
                    "match": { "any": [{ "resources": { "kinds": ["Namespace"] } }] },
                    "generate": {
                        "apiVersion": "v1",
                        "kind": "Secret",
                        "name": "regcred",
                        "namespace": "{{request.object.metadata.name}}",
                        "synchronize": true,
                        "clone": { "namespace": "default", "name": "regcred" }
                    }
                }]
            }
        }))
        .expect("policy must deserialize");

        let policy = AnyPolicy::from(policy);
        assert_eq!(policy.key(), "sync-secrets");
        assert_eq!(policy.spec().apply_rules, Some(ApplyRules::One));

        let generate = policy
            .rule("sync-image-pull-secret")
            .and_then(|r| r.generate.as_ref())
            .expect("rule must generate");
        assert!(generate.synchronize);
        assert_eq!(
            generate.pattern.clone,
            Some(CloneFrom {
                namespace: "default".to_string(),
                name: "regcred".to_string(),
            })
        );
        assert_eq!(
            generate.pattern.target(),
            ResourceSpec::new("v1", "Secret", "{{request.object.metadata.name}}", "regcred"),
        );
    }

    #[test]
    fn with_only_rule() {
        let policy = AnyPolicy::from(Policy::new(
            "gen",
            PolicySpec {
                rules: vec![
                    Rule {
                        name: "a".to_string(),
                        ..Default::default()
                    },
                    Rule {
                        name: "b".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        ));
        let only = policy.with_only_rule("b").expect("rule exists");
        assert_eq!(
            only.spec().rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
        assert!(policy.with_only_rule("c").is_none());
    }

    #[test]
    fn terminating_policies() {
        let policy: ClusterPolicy = serde_json::from_value(serde_json::json!({
            "apiVersion": "kyverno.io/v1",
            "kind": "ClusterPolicy",
            "metadata": { "name": "gen" },
            "spec": { "rules": [] }
        }))
        .expect("policy must deserialize");
        assert!(!AnyPolicy::from(policy.clone()).is_terminating());

        let mut deleting = policy;
        deleting.metadata.deletion_timestamp =
            serde_json::from_value(serde_json::json!("2024-05-01T10:00:00Z"))
                .expect("timestamp must deserialize");
        assert!(AnyPolicy::from(deleting).is_terminating());
    }
}
