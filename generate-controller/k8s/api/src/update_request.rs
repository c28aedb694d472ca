use crate::ResourceSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Annotation counting how many times a failed request has been retried.
pub const RETRY_COUNT_ANNOTATION: &str = "generate.kyverno.io/retry-count";

/// A queued unit of background reconciliation work.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kyverno.io",
    version = "v2",
    kind = "UpdateRequest",
    namespaced,
    status = "UpdateRequestStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequestSpec {
    #[serde(default)]
    pub request_type: RequestType,

    /// The key of the owning policy: `namespace/name` or `name`.
    pub policy: String,

    #[serde(default)]
    pub rule_context: Vec<RuleContext>,

    #[serde(default)]
    pub context: UpdateRequestContext,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RequestType {
    #[default]
    #[serde(rename = "generate")]
    Generate,
    #[serde(rename = "mutate")]
    Mutate,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleContext {
    pub rule: String,

    #[serde(default)]
    pub trigger: ResourceSpec,

    #[serde(default)]
    pub delete_downstream: bool,

    #[serde(default)]
    pub synchronize: bool,
}

/// A snapshot of the admission request that produced the update request.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequestContext {
    #[serde(default)]
    pub user_info: RequestInfo,

    #[serde(default)]
    pub admission_request_info: AdmissionRequestInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequestInfo {
    /// The raw admission request, if the request originated from admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission_request: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequestStatus {
    #[serde(default)]
    pub state: UpdateRequestState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_resources: Vec<ResourceSpec>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum UpdateRequestState {
    /// Not yet observed by the controller.
    #[default]
    #[serde(rename = "")]
    Unknown,
    Pending,
    Completed,
    Failed,
    Skip,
}

// === impl UpdateRequest ===

impl UpdateRequest {
    pub fn state(&self) -> UpdateRequestState {
        self.status
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn generated_resources(&self) -> &[ResourceSpec] {
        self.status
            .as_ref()
            .map(|s| s.generated_resources.as_slice())
            .unwrap_or_default()
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(RETRY_COUNT_ANNOTATION))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

// === impl AdmissionRequestInfo ===

impl AdmissionRequestInfo {
    fn field(&self, name: &str) -> Option<&Value> {
        self.admission_request
            .as_ref()
            .and_then(|r| r.get(name))
            .filter(|v| !v.is_null())
    }

    pub fn object(&self) -> Option<&Value> {
        self.field("object")
    }

    pub fn old_object(&self) -> Option<&Value> {
        self.field("oldObject")
    }

    pub fn sub_resource(&self) -> Option<&str> {
        self.field("subResource")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Display for UpdateRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "",
            Self::Pending => "Pending",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Skip => "Skip",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize() {
        let ur: UpdateRequest = serde_json::from_value(serde_json::json!({
            "apiVersion": "kyverno.io/v2",
            "kind": "UpdateRequest",
            "metadata": {
                "name": "ur-abc",
                "namespace": "kyverno",
                "annotations": { "generate.kyverno.io/retry-count": "2" }
            },
            "spec": {
                "requestType": "generate",
                "policy": "sync-secrets",
                "ruleContext": [{
                    "rule": "clone",
                    "trigger": { "apiVersion": "v1", "kind": "Namespace", "name": "team-a", "uid": "u1" },
                    "deleteDownstream": false,
                    "synchronize": true
                }],
                "context": {
                    "userInfo": {},
                    "admissionRequestInfo": {
                        "operation": "CREATE",
                        "admissionRequest": { "object": { "kind": "Namespace" }, "oldObject": null }
                    }
                }
            },
            "status": {
                "state": "Failed",
                "message": "boom",
                "generatedResources": [{ "apiVersion": "v1", "kind": "Secret", "namespace": "team-a", "name": "regcred" }]
            }
        }))
        .expect("update request must deserialize");

        assert_eq!(ur.state(), UpdateRequestState::Failed);
        assert_eq!(ur.retry_count(), 2);
        assert_eq!(
            ur.generated_resources(),
            &[ResourceSpec::new("v1", "Secret", "team-a", "regcred")]
        );
        let ctx = &ur.spec.context.admission_request_info;
        assert_eq!(ctx.operation, Some(Operation::Create));
        assert!(ctx.object().is_some());
        assert!(ctx.old_object().is_none());
        assert_eq!(
            ur.spec.rule_context[0].trigger,
            ResourceSpec::new("v1", "Namespace", "", "team-a").with_uid("u1")
        );
    }

    #[test]
    fn empty_state() {
        let status: UpdateRequestStatus =
            serde_json::from_value(serde_json::json!({ "state": "" })).unwrap();
        assert_eq!(status.state, UpdateRequestState::Unknown);
        let ur = UpdateRequest::new("ur", UpdateRequestSpec::default());
        assert_eq!(ur.state(), UpdateRequestState::Unknown);
        assert_eq!(ur.retry_count(), 0);
    }
}
