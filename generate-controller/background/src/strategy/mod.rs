//! Turns a generate template into create, update or skip decisions.

mod clone;
mod clone_list;
mod data;

use crate::{Error, GenerateResponse};
use generate_controller_core::{
    generate::{Source, Template},
    k8s::{DynamicObject, ResourceSpec, TypeMeta},
    pattern, ResourceClient,
};
use serde_json::Value;

pub use self::clone::strip_source_metadata;

/// Inputs shared by every strategy invocation within a rule.
pub struct Params<'a> {
    pub client: &'a dyn ResourceClient,
    pub synchronize: bool,
    /// True if an earlier pass recorded generated resources.
    pub has_prior: bool,
}

/// Decides what to do with each target described by a substituted template.
pub async fn generate(
    params: &Params<'_>,
    template: &Template,
) -> Vec<Result<GenerateResponse, Error>> {
    match &template.source {
        Source::Data(data) => vec![data::generate(params, &template.target, data).await],
        Source::Clone(from) => {
            vec![clone::generate(params, &template.target, &from.namespace, &from.name, false).await]
        }
        Source::CloneList(list) => clone_list::generate(params, &template.target, list).await,
    }
}

/// Builds a target object from a (possibly partial) document, forcing its
/// identity to the target's.
pub(crate) fn object_for_target(
    mut doc: Value,
    target: &ResourceSpec,
) -> Result<DynamicObject, Error> {
    if let Value::Object(map) = &mut doc {
        map.entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
    }
    let mut obj: DynamicObject = serde_json::from_value(doc)
        .map_err(|e| Error::Other(anyhow::anyhow!("invalid object for {target}: {e}")))?;

    let types = obj.types.get_or_insert_with(|| TypeMeta {
        api_version: String::new(),
        kind: String::new(),
    });
    if !target.api_version.is_empty() {
        types.api_version = target.api_version.clone();
    }
    if !target.kind.is_empty() {
        types.kind = target.kind.clone();
    }
    obj.metadata.name = Some(target.name.clone());
    obj.metadata.namespace = if target.namespace.is_empty() {
        None
    } else {
        Some(target.namespace.clone())
    };
    Ok(obj)
}

/// Compares the existing and desired objects in both directions, ignoring
/// server-managed metadata and status.
pub(crate) fn equivalent(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool, Error> {
    let normalize = |obj: &DynamicObject| -> Result<Value, Error> {
        let mut obj = obj.clone();
        strip_source_metadata(&mut obj.metadata);
        if let Value::Object(data) = &mut obj.data {
            data.remove("status");
        }
        serde_json::to_value(&obj).map_err(|e| Error::Other(e.into()))
    };
    let (existing, desired) = (normalize(existing)?, normalize(desired)?);
    Ok(pattern::matches(&existing, &desired).is_ok() && pattern::matches(&desired, &existing).is_ok())
}
