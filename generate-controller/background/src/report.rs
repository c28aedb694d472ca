use anyhow::Result;
use generate_controller_core::{
    k8s::{DynamicObject, ResourceSpec},
    provenance::{MANAGED_BY, MANAGED_BY_VALUE},
    EngineResponse, ReportWriter, ResourceClient, RuleStatus,
};
use serde_json::{json, Value};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

pub const REPORT_API_VERSION: &str = "reports.kyverno.io/v1";

/// Label linking a report to the resource it describes.
pub const RESOURCE_UID_LABEL: &str = "audit.kyverno.io/resource.uid";

/// Kinds that are never reported on.
const UNREPORTABLE_KINDS: [&str; 6] = [
    "Event",
    "UpdateRequest",
    "EphemeralReport",
    "ClusterEphemeralReport",
    "PolicyReport",
    "ClusterPolicyReport",
];

/// Writes ephemeral reports through the generic resource client.
#[derive(Clone)]
pub struct EphemeralReportWriter {
    client: Arc<dyn ResourceClient>,
}

// === impl EphemeralReportWriter ===

impl EphemeralReportWriter {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ReportWriter for EphemeralReportWriter {
    async fn write(&self, response: &EngineResponse) -> Result<()> {
        let Some(report) = build_report(response, SystemTime::now()) else {
            tracing::trace!(resource = %response.resource, "Resource is not reportable");
            return Ok(());
        };
        self.client.apply(report).await?;
        tracing::debug!(resource = %response.resource, "Wrote ephemeral report");
        Ok(())
    }
}

/// Returns true if results for resources of this kind may be reported.
pub fn is_reportable(resource: &ResourceSpec) -> bool {
    !resource.uid.is_empty()
        && !resource.kind.is_empty()
        && !UNREPORTABLE_KINDS.contains(&resource.kind.as_str())
}

/// Builds the report for an engine response, named after the resource's uid.
/// Cluster-scoped resources get a cluster-scoped report.
pub fn build_report(response: &EngineResponse, now: SystemTime) -> Option<DynamicObject> {
    let resource = &response.resource;
    if !is_reportable(resource) || response.is_empty() {
        return None;
    }

    let timestamp = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut summary = json!({"pass": 0, "fail": 0, "warn": 0, "error": 0, "skip": 0});
    let results = response
        .rules
        .iter()
        .map(|rule| {
            let key = rule.status.to_string();
            if let Some(count) = summary.get_mut(&key) {
                *count = json!(count.as_u64().unwrap_or(0) + 1);
            }
            json!({
                "policy": response.policy,
                "rule": rule.name,
                "result": key,
                "message": rule.message,
                "source": "kyverno",
                "scored": rule.status != RuleStatus::Skip,
                "timestamp": {"seconds": timestamp.as_secs(), "nanos": 0},
            })
        })
        .collect::<Vec<_>>();

    let owner = json!({
        "apiVersion": resource.api_version,
        "kind": resource.kind,
        "name": resource.name,
        "uid": resource.uid,
    });
    let (kind, namespace) = if resource.namespace.is_empty() {
        ("ClusterEphemeralReport", Value::Null)
    } else {
        ("EphemeralReport", Value::String(resource.namespace.clone()))
    };

    let mut metadata = json!({
        "name": resource.uid,
        "labels": {
            MANAGED_BY: MANAGED_BY_VALUE,
            RESOURCE_UID_LABEL: resource.uid,
        },
        "ownerReferences": [owner],
    });
    if !namespace.is_null() {
        metadata["namespace"] = namespace;
    }

    let report = json!({
        "apiVersion": REPORT_API_VERSION,
        "kind": kind,
        "metadata": metadata,
        "spec": {
            "owner": owner,
            "results": results,
            "summary": summary,
        },
    });
    match serde_json::from_value(report) {
        Ok(report) => Some(report),
        Err(error) => {
            tracing::warn!(%error, "Failed to build ephemeral report");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generate_controller_core::RuleResponse;
    use pretty_assertions::assert_eq;

    fn response(resource: ResourceSpec) -> EngineResponse {
        EngineResponse {
            policy: "ns/p".to_string(),
            resource,
            rules: vec![
                RuleResponse::pass("gen", "ok"),
                RuleResponse::error("other", "boom"),
            ],
        }
    }

    #[test]
    fn builds_namespaced_report() {
        let resource = ResourceSpec::new("v1", "ConfigMap", "ns", "cm").with_uid("u1");
        let report = build_report(&response(resource), UNIX_EPOCH).expect("report");

        let types = report.types.as_ref().expect("types");
        assert_eq!(types.kind, "EphemeralReport");
        assert_eq!(report.metadata.name.as_deref(), Some("u1"));
        assert_eq!(report.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(
            report.data["spec"]["summary"],
            json!({"pass": 1, "fail": 0, "warn": 0, "error": 1, "skip": 0})
        );
        assert_eq!(report.data["spec"]["results"][0]["rule"], json!("gen"));
        assert_eq!(report.data["spec"]["owner"]["uid"], json!("u1"));
    }

    #[test]
    fn cluster_scoped_and_unreportable() {
        let ns = ResourceSpec::new("v1", "Namespace", "", "dev").with_uid("u2");
        let report = build_report(&response(ns), UNIX_EPOCH).expect("report");
        assert_eq!(report.types.expect("types").kind, "ClusterEphemeralReport");
        assert_eq!(report.metadata.namespace, None);

        let event = ResourceSpec::new("v1", "Event", "ns", "e").with_uid("u3");
        assert!(build_report(&response(event), UNIX_EPOCH).is_none());

        let no_uid = ResourceSpec::new("v1", "ConfigMap", "ns", "cm");
        assert!(build_report(&response(no_uid), UNIX_EPOCH).is_none());
    }
}
