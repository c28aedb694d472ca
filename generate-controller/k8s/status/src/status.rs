use crate::metrics::ControllerMetrics;
use anyhow::{bail, Result};
use generate_controller_core::{
    k8s::{
        update_request::RETRY_COUNT_ANNOTATION, UpdateRequest, UpdateRequestState,
        UpdateRequestStatus,
    },
    StatusStore,
};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use serde_json::{json, Value};
use tokio::time;

/// Writes update request status and lifecycle changes.
///
/// Status is written as a merge patch on the status subresource. Every
/// patch is bounded by a timeout so that a slow API server cannot stall a
/// worker indefinitely.
#[derive(Clone)]
pub struct StatusControl {
    client: kube::Client,
    namespace: String,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
}

// === impl StatusControl ===

impl StatusControl {
    pub fn new(
        client: kube::Client,
        namespace: impl ToString,
        patch_timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            patch_timeout,
            metrics,
        }
    }

    fn api(&self) -> Api<UpdateRequest> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Moves a request to `Pending`, keeping its recorded resources.
    pub async fn set_pending(&self, name: &str) -> Result<UpdateRequest> {
        let patch = json!({
            "status": {
                "state": UpdateRequestState::Pending,
                "message": Value::Null,
            }
        });
        self.patch_status(name, patch).await
    }

    /// Bumps the retry counter of a failed request and moves it back to
    /// `Pending`.
    pub async fn retry(&self, ur: &UpdateRequest) -> Result<UpdateRequest> {
        let name = ur.metadata.name.as_deref().unwrap_or_default();
        let patch = retry_patch(ur.retry_count() + 1);
        let params = PatchParams::default();
        self.api()
            .patch(name, &params, &Patch::Merge(&patch))
            .await?;
        self.set_pending(name).await
    }

    /// Deletes a request. A request that is already gone is not an error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn patch_status(&self, name: &str, patch: Value) -> Result<UpdateRequest> {
        let api = self.api();
        let params = PatchParams::default();
        let patch = Patch::Merge(&patch);
        match time::timeout(self.patch_timeout, api.patch_status(name, &params, &patch)).await {
            Ok(Ok(ur)) => {
                self.metrics.patch_succeeded.inc();
                Ok(ur)
            }
            Ok(Err(error)) => {
                self.metrics.patch_failed.inc();
                tracing::error!(%name, %error, "Failed to patch update request status");
                Err(error.into())
            }
            Err(_) => {
                self.metrics.patch_timeout.inc();
                tracing::error!(
                    %name,
                    timeout = ?self.patch_timeout,
                    "Patching update request status timed out"
                );
                bail!("patching status of {name} timed out")
            }
        }
    }
}

#[async_trait::async_trait]
impl StatusStore for StatusControl {
    async fn update_status(&self, name: &str, status: UpdateRequestStatus) -> Result<UpdateRequest> {
        tracing::debug!(%name, state = %status.state, "Updating status");
        self.patch_status(name, status_patch(&status)).await
    }
}

/// Builds a merge patch replacing the whole status. Empty fields are
/// nulled so that stale values are cleared.
fn status_patch(status: &UpdateRequestStatus) -> Value {
    let message = if status.message.is_empty() {
        Value::Null
    } else {
        Value::String(status.message.clone())
    };
    let generated = if status.generated_resources.is_empty() {
        Value::Null
    } else {
        json!(status.generated_resources)
    };
    json!({
        "status": {
            "state": status.state,
            "message": message,
            "generatedResources": generated,
        }
    })
}

fn retry_patch(count: u32) -> Value {
    json!({
        "metadata": {
            "annotations": {
                RETRY_COUNT_ANNOTATION: count.to_string(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use generate_controller_core::k8s::ResourceSpec;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_patch_replaces_fields() {
        let status = UpdateRequestStatus {
            state: UpdateRequestState::Failed,
            message: "boom".to_string(),
            generated_resources: vec![ResourceSpec::new("v1", "ConfigMap", "ns", "cm")],
        };
        assert_eq!(
            status_patch(&status),
            json!({
                "status": {
                    "state": "Failed",
                    "message": "boom",
                    "generatedResources": [{
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "namespace": "ns",
                        "name": "cm",
                    }],
                }
            })
        );

        let status = UpdateRequestStatus {
            state: UpdateRequestState::Completed,
            ..Default::default()
        };
        assert_eq!(
            status_patch(&status),
            json!({
                "status": {
                    "state": "Completed",
                    "message": null,
                    "generatedResources": null,
                }
            })
        );
    }

    #[test]
    fn retry_patch_sets_annotation() {
        assert_eq!(
            retry_patch(2),
            json!({"metadata": {"annotations": {"generate.kyverno.io/retry-count": "2"}}})
        );
    }
}
