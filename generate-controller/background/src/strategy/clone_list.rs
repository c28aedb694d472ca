use super::{clone, Params};
use crate::{Error, GenerateResponse};
use generate_controller_core::{
    k8s::{policy::CloneList, ResourceExt, ResourceSpec},
    KindSelector,
};

/// Generates one target per source object selected by a clone list. Each
/// source yields its own response; a failure to list a kind is reported as a
/// single failed response.
pub(super) async fn generate(
    params: &Params<'_>,
    target: &ResourceSpec,
    list: &CloneList,
) -> Vec<Result<GenerateResponse, Error>> {
    let selector = list.selector.clone().unwrap_or_default();
    let mut responses = Vec::new();

    for kind in &list.kinds {
        let (api_version, kind) = match resolve_kind(params, kind).await {
            Ok(resolved) => resolved,
            Err(error) => {
                responses.push(Err(Error::List {
                    kind: kind.clone(),
                    namespace: list.namespace.clone(),
                    error,
                }));
                continue;
            }
        };

        let sources = match params
            .client
            .list(&api_version, &kind, &list.namespace, &selector)
            .await
        {
            Ok(sources) => sources,
            Err(error) => {
                responses.push(Err(Error::List {
                    kind,
                    namespace: list.namespace.clone(),
                    error,
                }));
                continue;
            }
        };
        tracing::debug!(%kind, namespace = %list.namespace, sources = sources.len(), "Listed clone sources");

        for source in sources {
            let target = ResourceSpec::new(
                api_version.clone(),
                kind.clone(),
                target.namespace.clone(),
                source.name_any(),
            );
            if source.namespace().unwrap_or_default() == target.namespace {
                tracing::debug!(%target, "Skipping clone into the source namespace");
                responses.push(Ok(GenerateResponse::skip(target)));
                continue;
            }
            responses.push(clone::generate_from_source(params, &target, source).await);
        }
    }

    responses
}

/// Resolves a kind selector to an apiVersion and kind, consulting discovery
/// when no version is given.
async fn resolve_kind(
    params: &Params<'_>,
    selector: &str,
) -> Result<(String, String), generate_controller_core::ClientError> {
    let selector = selector
        .parse::<KindSelector>()
        .map_err(|e| anyhow::anyhow!("invalid kind {selector:?}: {e}"))?;
    if let Some(api_version) = selector.api_version() {
        return Ok((api_version, selector.kind));
    }
    let resolved = params.client.discovery().resolve("", &selector.kind).await?;
    Ok((resolved.api_version(), resolved.kind))
}
