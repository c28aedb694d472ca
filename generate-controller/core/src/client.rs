use crate::k8s::{labels::Selector, DynamicObject, ResourceSpec};

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Errors returned by a [`ResourceClient`].
///
/// The distinction between the variants drives reconciliation control flow;
/// everything else is carried opaquely in [`ClientError::Other`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict writing {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A resolved API resource type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// The plural resource name used in API paths.
    pub plural: String,
    pub namespaced: bool,
}

/// Maps kinds onto the API resources that serve them.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Resolves a kind. An empty `api_version` selects the preferred version
    /// of whichever group serves the kind.
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedKind>;
}

/// Accesses arbitrary resources in the cluster.
///
/// Objects passed to `create`, `update` and `apply` must carry their type
/// metadata; their namespace and name are read from the object metadata.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject>;

    /// Lists objects of a kind. An empty `namespace` lists across all
    /// namespaces (or cluster-scoped objects).
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Writes the object with server-side apply semantics.
    async fn apply(&self, obj: DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, api_version: &str, kind: &str, namespace: &str, name: &str)
        -> Result<()>;

    fn discovery(&self) -> &dyn Discovery;
}

// === impl ClientError ===

impl ClientError {
    pub fn not_found(spec: &ResourceSpec) -> Self {
        Self::NotFound(spec.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

// === impl ResolvedKind ===

impl ResolvedKind {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}
