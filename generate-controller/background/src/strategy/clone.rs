use super::{equivalent, Params};
use crate::{Error, GenerateResponse};
use generate_controller_core::{
    k8s::{DynamicObject, ObjectMeta, ResourceExt, ResourceSpec, TypeMeta},
    provenance,
};

/// Generates a target by copying a single source object.
pub(super) async fn generate(
    params: &Params<'_>,
    target: &ResourceSpec,
    source_namespace: &str,
    source_name: &str,
    is_clone_list: bool,
) -> Result<GenerateResponse, Error> {
    if !is_clone_list && source_namespace == target.namespace && source_name == target.name {
        tracing::debug!(%target, "Source and target are the same resource");
        return Ok(GenerateResponse::skip(target.clone()));
    }

    let source_spec = ResourceSpec::new(
        target.api_version.clone(),
        target.kind.clone(),
        source_namespace,
        source_name,
    );
    let source = params
        .client
        .get(
            &source_spec.api_version,
            &source_spec.kind,
            &source_spec.namespace,
            &source_spec.name,
        )
        .await
        .map_err(|error| Error::Source {
            source_spec: source_spec.to_string(),
            error,
        })?;

    generate_from_source(params, target, source).await
}

/// Generates a target from an already fetched source object.
pub(super) async fn generate_from_source(
    params: &Params<'_>,
    target: &ResourceSpec,
    source: DynamicObject,
) -> Result<GenerateResponse, Error> {
    let mut source_spec = ResourceSpec::from_object(&source);
    if source_spec.api_version.is_empty() {
        source_spec.api_version = target.api_version.clone();
    }
    if source_spec.kind.is_empty() {
        source_spec.kind = target.kind.clone();
    }

    tag_source(params, &source).await;

    let existing = params
        .client
        .get(&target.api_version, &target.kind, &target.namespace, &target.name)
        .await;

    let existing = match existing {
        Err(error) if error.is_not_found() => {
            if params.has_prior && !params.synchronize {
                tracing::debug!(%target, "Target was deleted and synchronize is disabled");
                return Ok(GenerateResponse::skip(target.clone()));
            }
            let obj = copy_source(&source, target, None);
            return Ok(GenerateResponse::create(obj, target.clone()).with_source(source_spec));
        }
        Err(error) => return Err(error.into()),
        Ok(existing) => existing,
    };

    if !params.synchronize {
        tracing::debug!(%target, "Target exists and synchronize is disabled");
        return Ok(GenerateResponse::skip(target.clone()));
    }

    let obj = copy_source(&source, target, Some(&existing));
    // Provenance labels are stamped at write time; compare as if they were.
    let mut stamped = obj.clone();
    let provenance_labels = existing
        .labels()
        .iter()
        .filter(|(key, _)| provenance::is_provenance_key(key))
        .map(|(key, value)| (key.clone(), value.clone()));
    stamped.labels_mut().extend(provenance_labels);
    if equivalent(&existing, &stamped)? {
        tracing::debug!(%target, "Target is up to date with its source");
        return Ok(GenerateResponse::skip(target.clone()));
    }
    Ok(GenerateResponse::update(obj, target.clone()).with_source(source_spec))
}

/// Drops metadata that identifies a specific stored object so that a copy of
/// it can be written elsewhere.
pub fn strip_source_metadata(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.generation = None;
    meta.self_link = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generate_name = None;
    meta.finalizers = None;
}

/// Builds the target object from the source, taking server-assigned metadata
/// from the existing target when there is one.
fn copy_source(
    source: &DynamicObject,
    target: &ResourceSpec,
    existing: Option<&DynamicObject>,
) -> DynamicObject {
    let mut metadata = ObjectMeta {
        name: Some(target.name.clone()),
        namespace: (!target.namespace.is_empty()).then(|| target.namespace.clone()),
        labels: source.metadata.labels.clone(),
        annotations: source.metadata.annotations.clone(),
        ..Default::default()
    };
    if let Some(labels) = metadata.labels.as_mut() {
        labels.remove(provenance::CLONE_SOURCE);
    }
    if source.metadata.namespace == metadata.namespace {
        metadata.owner_references = source.metadata.owner_references.clone();
    }
    if let Some(existing) = existing {
        metadata.uid = existing.metadata.uid.clone();
        metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        metadata.resource_version = existing.metadata.resource_version.clone();
        metadata.self_link = existing.metadata.self_link.clone();
        metadata.managed_fields = existing.metadata.managed_fields.clone();
    }

    let mut types = source.types.clone().unwrap_or_else(|| TypeMeta {
        api_version: String::new(),
        kind: String::new(),
    });
    if types.api_version.is_empty() {
        types.api_version = target.api_version.clone();
    }
    if types.kind.is_empty() {
        types.kind = target.kind.clone();
    }

    DynamicObject {
        types: Some(types),
        metadata,
        data: source.data.clone(),
    }
}

/// Marks the source as a clone source. Failures are logged and ignored.
async fn tag_source(params: &Params<'_>, source: &DynamicObject) {
    let mut labels = source.labels().clone();
    if !provenance::tag_source(&mut labels) {
        return;
    }
    let mut tagged = source.clone();
    tagged.metadata.labels = Some(labels);
    if let Err(error) = params.client.update(tagged).await {
        tracing::warn!(
            name = %source.name_any(),
            namespace = ?source.namespace(),
            %error,
            "Failed to label clone source"
        );
    }
}
