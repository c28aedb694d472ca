use crate::metrics::SizedIndex;
use ahash::AHashMap as HashMap;
use generate_controller_core::{
    k8s::{policy::AnyPolicy, ClusterPolicy, Policy},
    PolicyLister,
};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedPolicyIndex = Arc<RwLock<PolicyIndex>>;

/// Holds every `Policy` and `ClusterPolicy` that declares at least one
/// generate rule, keyed the way update requests reference them.
#[derive(Debug, Default)]
pub struct PolicyIndex {
    policies: HashMap<String, AnyPolicy>,
}

/// A read handle on a [`PolicyIndex`].
#[derive(Clone, Debug)]
pub struct PolicyReader(SharedPolicyIndex);

// === impl PolicyIndex ===

impl PolicyIndex {
    pub fn shared() -> SharedPolicyIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn reader(index: &SharedPolicyIndex) -> PolicyReader {
        PolicyReader(index.clone())
    }

    pub fn get(&self, key: &str) -> Option<&AnyPolicy> {
        self.policies.get(key)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn insert(&mut self, policy: AnyPolicy) {
        let key = policy.key();
        if !policy.spec().rules.iter().any(|r| r.has_generate()) {
            if self.policies.remove(&key).is_some() {
                tracing::debug!(policy = %key, "Policy no longer generates");
            }
            return;
        }
        tracing::debug!(policy = %key, "Indexed policy");
        self.policies.insert(key, policy);
    }

    fn remove(&mut self, key: &str) {
        if self.policies.remove(key).is_some() {
            tracing::debug!(policy = %key, "Removed policy");
        }
    }

    fn count(&self, namespaced: bool, namespace: &str) -> usize {
        self.policies
            .values()
            .filter(|p| p.is_namespaced() == namespaced && p.namespace() == namespace)
            .count()
    }
}

impl IndexNamespacedResource<Policy> for PolicyIndex {
    fn apply(&mut self, policy: Policy) {
        self.insert(policy.into());
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove(&format!("{namespace}/{name}"));
    }
}

impl IndexClusterResource<ClusterPolicy> for PolicyIndex {
    fn apply(&mut self, policy: ClusterPolicy) {
        self.insert(policy.into());
    }

    fn delete(&mut self, name: String) {
        self.remove(&name);
    }
}

impl SizedIndex<Policy> for PolicyIndex {
    fn size(&self, namespace: &str) -> usize {
        self.count(true, namespace)
    }
}

impl SizedIndex<ClusterPolicy> for PolicyIndex {
    fn size(&self, _namespace: &str) -> usize {
        self.count(false, "")
    }
}

// === impl PolicyReader ===

impl PolicyLister for PolicyReader {
    fn get(&self, key: &str) -> Option<AnyPolicy> {
        self.0.read().get(key).cloned()
    }
}

