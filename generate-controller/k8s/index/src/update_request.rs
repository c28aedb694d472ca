use crate::metrics::SizedIndex;
use ahash::AHashMap as HashMap;
use generate_controller_core::k8s::{update_request::RequestType, ResourceExt, UpdateRequest};
use kubert::index::IndexNamespacedResource;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type SharedUpdateRequestIndex = Arc<RwLock<UpdateRequestIndex>>;

/// Holds the generate update requests in the controller's namespace and
/// publishes the name of each one that changes.
///
/// Deletions are not published: a worker that pops a name which is no
/// longer indexed drops it.
#[derive(Debug)]
pub struct UpdateRequestIndex {
    namespace: String,
    requests: HashMap<String, UpdateRequest>,
    changes: mpsc::UnboundedSender<String>,
}

// === impl UpdateRequestIndex ===

impl UpdateRequestIndex {
    pub fn shared(
        namespace: impl ToString,
        changes: mpsc::UnboundedSender<String>,
    ) -> SharedUpdateRequestIndex {
        Arc::new(RwLock::new(Self {
            namespace: namespace.to_string(),
            requests: HashMap::default(),
            changes,
        }))
    }

    pub fn get(&self, name: &str) -> Option<UpdateRequest> {
        self.requests.get(name).cloned()
    }

    /// Lists the names of every indexed request.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.requests.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl IndexNamespacedResource<UpdateRequest> for UpdateRequestIndex {
    fn apply(&mut self, ur: UpdateRequest) {
        let namespace = ur.namespace().unwrap_or_default();
        if namespace != self.namespace {
            tracing::trace!(%namespace, name = %ur.name_any(), "Ignoring update request");
            return;
        }
        if ur.spec.request_type != RequestType::Generate {
            return;
        }

        let name = ur.name_any();
        if let Some(prior) = self.requests.get(&name) {
            // Relists redeliver unchanged objects.
            if prior.metadata.resource_version.is_some()
                && prior.metadata.resource_version == ur.metadata.resource_version
            {
                return;
            }
        }
        tracing::debug!(%name, state = %ur.state(), "Indexed update request");
        self.requests.insert(name.clone(), ur);
        if self.changes.send(name).is_err() {
            tracing::debug!("Update request queue closed");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == self.namespace && self.requests.remove(&name).is_some() {
            tracing::debug!(%name, "Removed update request");
        }
    }
}

impl SizedIndex<UpdateRequest> for UpdateRequestIndex {
    fn size(&self, namespace: &str) -> usize {
        if namespace == self.namespace {
            self.requests.len()
        } else {
            0
        }
    }
}
