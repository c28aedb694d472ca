use kube::ResourceExt;
use kubert::index::{ClusterRemoved, NamespacedRemoved};
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps a shared index, counting the updates it observes and tracking its
/// size per namespace.
pub struct IndexMetrics<T> {
    inner: T,
    size: Family<NamespacedIndexLabels, Gauge>,
    applies: Family<NamespacedIndexLabels, Counter>,
    deletes: Family<NamespacedIndexLabels, Counter>,
    resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespacedIndexLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

/// Reports how many resources of type `R` an index holds in a namespace.
/// Cluster-scoped resources are counted under the empty namespace.
pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self, namespace: &str) -> usize {
        self.read().size(namespace)
    }
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let size = Family::default();
        prom.register(
            "size",
            "Gauge of the number of resources in the index",
            size.clone(),
        );

        let applies = Family::default();
        prom.register("applies", "Count of applies to the index", applies.clone());

        let deletes = Family::default();
        prom.register("deletes", "Count of deletes from the index", deletes.clone());

        let resets = Family::default();
        prom.register("resets", "Count of resets of the index", resets.clone());

        Self {
            inner,
            size,
            applies,
            deletes,
            resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn labels(namespace: &str, kind: &str) -> NamespacedIndexLabels {
        NamespacedIndexLabels {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl<S> IndexMetrics<Arc<RwLock<S>>> {
    fn record_size<R>(&self, namespace: &str, kind: &str)
    where
        S: SizedIndex<R>,
    {
        let size = SizedIndex::<R>::size(&self.inner, namespace);
        self.size
            .get_or_create(&Self::labels(namespace, kind))
            .set(size as i64);
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let kind = R::kind(&());
        let namespace = resource.namespace().unwrap_or_default();
        self.applies.get_or_create(&Self::labels(&namespace, &kind)).inc();
        self.inner.write().apply(resource);
        self.record_size::<R>(&namespace, &kind);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let kind = R::kind(&());
        self.deletes.get_or_create(&Self::labels(&namespace, &kind)).inc();
        self.inner.write().delete(namespace.clone(), name);
        self.record_size::<R>(&namespace, &kind);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let kind = R::kind(&());
        let mut namespaces = resources
            .iter()
            .flat_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();

        self.resets
            .get_or_create(&IndexLabels {
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().reset(resources, removed);
        for namespace in namespaces {
            self.record_size::<R>(&namespace, &kind);
        }
    }
}

impl<R, T> kubert::index::IndexClusterResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexClusterResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let kind = R::kind(&());
        self.applies.get_or_create(&Self::labels("", &kind)).inc();
        self.inner.write().apply(resource);
        self.record_size::<R>("", &kind);
    }

    fn delete(&mut self, name: String) {
        let kind = R::kind(&());
        self.deletes.get_or_create(&Self::labels("", &kind)).inc();
        self.inner.write().delete(name);
        self.record_size::<R>("", &kind);
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        let kind = R::kind(&());
        self.resets
            .get_or_create(&IndexLabels {
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().reset(resources, removed);
        self.record_size::<R>("", &kind);
    }
}
