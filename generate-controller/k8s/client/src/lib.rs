//! A [`ResourceClient`] backed by the Kubernetes API.
//!
//! Objects are handled as [`DynamicObject`]s so that any kind a policy names
//! can be read and written. Kinds are resolved through API discovery and
//! cached for the lifetime of the client.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::AHashMap as HashMap;
use generate_controller_core::{
    client::Result,
    k8s::{labels::Selector, ApiResource, DynamicObject, GroupVersionKind, ResourceExt},
    ClientError, Discovery, ResolvedKind, ResourceClient,
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    discovery::{self, Scope},
    Client,
};
use parking_lot::RwLock;

/// The field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "kyverno-generate";

pub struct KubeClient {
    client: Client,
    kinds: RwLock<HashMap<(String, String), ResolvedKind>>,
}

// === impl KubeClient ===

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kinds: Default::default(),
        }
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Api<DynamicObject>> {
        let resolved = self.resolve(api_version, kind).await?;
        let ar = api_resource(&resolved);
        if resolved.namespaced && !namespace.is_empty() {
            Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    async fn api_for(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String)> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("object {} has no type metadata", obj.name_any()))?;
        let namespace = obj.namespace().unwrap_or_default();
        let api = self.api(&types.api_version, &types.kind, &namespace).await?;
        Ok((api, obj.name_any()))
    }

    /// Searches every served group for the kind.
    async fn discover(&self, kind: &str) -> Result<ResolvedKind> {
        let discovery = discovery::Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|error| ClientError::Other(error.into()))?;
        for group in discovery.groups() {
            if let Some((ar, caps)) = group.recommended_kind(kind) {
                tracing::debug!(%kind, api_version = %ar.api_version, "Discovered kind");
                return Ok(resolved_kind(ar, caps.scope));
            }
        }
        Err(ClientError::NotFound(format!("kind {kind}")))
    }
}

#[async_trait::async_trait]
impl Discovery for KubeClient {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedKind> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(resolved) = self.kinds.read().get(&key) {
            return Ok(resolved.clone());
        }

        let resolved = if api_version.is_empty() {
            self.discover(kind).await?
        } else {
            let (group, version) = generate_controller_core::k8s::split_api_version(api_version);
            let gvk = GroupVersionKind::gvk(group, version, kind);
            let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
                .await
                .map_err(|error| match error {
                    kube::Error::Api(ae) if ae.code == 404 => {
                        ClientError::NotFound(format!("kind {api_version}/{kind}"))
                    }
                    error => from_kube(error, kind),
                })?;
            resolved_kind(ar, caps.scope)
        };

        self.kinds.write().insert(key, resolved.clone());
        Ok(resolved)
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject> {
        let api = self.api(api_version, kind, namespace).await?;
        api.get(name).await.map_err(|error| from_kube(error, name))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api(api_version, kind, namespace).await?;
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }
        let list = api
            .list(&params)
            .await
            .map_err(|error| from_kube(error, kind))?;
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                // List items omit their type metadata.
                if obj.types.is_none() {
                    obj.types = Some(generate_controller_core::k8s::TypeMeta {
                        api_version: api_version.to_string(),
                        kind: kind.to_string(),
                    });
                }
                obj
            })
            .collect())
    }

    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.api_for(&obj).await?;
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(|error| from_kube(error, &name))
    }

    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.api_for(&obj).await?;
        api.replace(&name, &PostParams::default(), &obj)
            .await
            .map_err(|error| from_kube(error, &name))
    }

    async fn apply(&self, obj: DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.api_for(&obj).await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&obj))
            .await
            .map_err(|error| from_kube(error, &name))
    }

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let api = self.api(api_version, kind, namespace).await?;
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|error| from_kube(error, name))?;
        Ok(())
    }

    fn discovery(&self) -> &dyn Discovery {
        self
    }
}

fn resolved_kind(ar: ApiResource, scope: Scope) -> ResolvedKind {
    ResolvedKind {
        group: ar.group,
        version: ar.version,
        kind: ar.kind,
        plural: ar.plural,
        namespaced: matches!(scope, Scope::Namespaced),
    }
}

fn api_resource(kind: &ResolvedKind) -> ApiResource {
    ApiResource {
        group: kind.group.clone(),
        version: kind.version.clone(),
        api_version: kind.api_version(),
        kind: kind.kind.clone(),
        plural: kind.plural.clone(),
    }
}

/// Classifies API errors by the status the server returned.
fn from_kube(error: kube::Error, name: &str) -> ClientError {
    match error {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(name.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ClientError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(name.to_string()),
        error => ClientError::Other(error.into()),
    }
}
