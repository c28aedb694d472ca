use super::{object_for_target, Params};
use crate::{Error, GenerateResponse};
use generate_controller_core::k8s::ResourceSpec;
use serde_json::Value;

/// Generates a target from inline data.
pub(super) async fn generate(
    params: &Params<'_>,
    target: &ResourceSpec,
    data: &Value,
) -> Result<GenerateResponse, Error> {
    let existing = params
        .client
        .get(&target.api_version, &target.kind, &target.namespace, &target.name)
        .await;

    match existing {
        Err(error) if error.is_not_found() => {
            if params.has_prior && !params.synchronize {
                tracing::debug!(%target, "Target was deleted and synchronize is disabled");
                return Ok(GenerateResponse::skip(target.clone()));
            }
            let obj = object_for_target(data.clone(), target)?;
            Ok(GenerateResponse::create(obj, target.clone()))
        }
        Err(error) => Err(error.into()),
        Ok(_) if !params.synchronize => {
            tracing::debug!(%target, "Target exists and synchronize is disabled");
            Ok(GenerateResponse::skip(target.clone()))
        }
        Ok(existing) => {
            let mut obj = object_for_target(data.clone(), target)?;
            obj.metadata.resource_version = existing.metadata.resource_version;
            Ok(GenerateResponse::update(obj, target.clone()))
        }
    }
}
