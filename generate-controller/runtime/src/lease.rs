use anyhow::{Context, Result};
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1 as coordv1};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Resource,
};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(15);
const LEASE_NAME: &str = "kyverno-background-controller";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Ensures the lease exists and starts competing for it. Only the holder
/// processes update requests.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The controller's deployment owns the lease so that it is removed with
    // the controller.
    let deployment = Api::<Deployment>::namespaced(runtime.client(), ns)
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch deployment {ns}/{deployment_name}"))?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("deployment has no name or uid")?;

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Only create the lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [
                    (
                        "app.kubernetes.io/component".to_string(),
                        "background-controller".to_string(),
                    ),
                    ("app.kubernetes.io/part-of".to_string(), "kyverno".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    let params = PatchParams {
        field_manager: Some(generate_controller_core::CONTROLLER_NAME.to_string()),
        ..Default::default()
    };
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(kube::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}
