//! Applies a generate rule for a single trigger: substitutes variables into
//! the rule's templates, asks a strategy what to do with each target, and
//! writes the results.

use crate::{
    foreach,
    response::{Action, GenerateResponse},
    strategy::{self, equivalent, Params},
    Error, Errors,
};
use generate_controller_core::{
    generate::{Body, GenerationSpec, Source, Template},
    k8s::{
        policy::{CloneFrom, CloneList},
        DynamicObject, ResourceExt, ResourceSpec,
    },
    provenance::{Provenance, RuleRef},
    Engine, PolicyContext, ResourceClient,
};
use serde_json::Value;

/// Attempts made to update a target when the write conflicts with a
/// concurrent modification.
const MAX_CONFLICT_RETRIES: usize = 5;

/// Generates the downstream resources of one rule for one trigger.
pub struct Generator<'a> {
    pub client: &'a dyn ResourceClient,
    pub engine: &'a dyn Engine,
    pub rule: RuleRef,
    pub trigger: ResourceSpec,
    pub synchronize: bool,
    pub server_side_apply: bool,
    /// True if earlier passes recorded generated resources for the request.
    pub has_prior: bool,
}

// === impl Generator ===

impl Generator<'_> {
    /// Applies the rule, returning every target that was created or updated.
    ///
    /// Targets written before a failure are returned alongside the error.
    pub async fn apply(
        &self,
        ctx: &mut PolicyContext,
        spec: &GenerationSpec,
    ) -> (Vec<ResourceSpec>, Result<(), Error>) {
        let mut generated = Vec::new();
        let result = match &spec.body {
            Body::Single(template) => self.generate(ctx, template, &mut generated).await,
            Body::ForEach(blocks) => foreach::apply(self, ctx, blocks, &mut generated).await,
        };
        (generated, result)
    }

    /// Generates the targets of a single template in the current context.
    pub(crate) async fn generate(
        &self,
        ctx: &PolicyContext,
        template: &Template,
        generated: &mut Vec<ResourceSpec>,
    ) -> Result<(), Error> {
        let template = substitute_template(self.engine, ctx, template)?;
        let params = Params {
            client: self.client,
            synchronize: self.synchronize,
            has_prior: self.has_prior,
        };

        let mut errors = Errors::default();
        for response in strategy::generate(&params, &template).await {
            let result = match response {
                Ok(response) => self.materialize(response).await,
                Err(error) => Err(error),
            };
            match result {
                Ok(Some(target)) => generated.push(target),
                Ok(None) => {}
                Err(error) => errors.push(error),
            }
        }
        errors.into_error()
    }

    /// Writes a strategy's decision. Returns the target if it was created or
    /// updated.
    async fn materialize(&self, response: GenerateResponse) -> Result<Option<ResourceSpec>, Error> {
        let GenerateResponse {
            action,
            data,
            target,
            source,
        } = response;
        let Some(mut obj) = data.filter(|_| action != Action::Skip) else {
            tracing::debug!(%target, "Nothing to generate");
            return Ok(None);
        };

        let mut provenance = Provenance::new(self.rule.clone()).with_trigger(self.trigger.clone());
        if let Some(source) = source {
            provenance = provenance.with_source(source);
        }
        let mut labels = obj.labels().clone();
        provenance.encode_into(&mut labels);
        obj.metadata.labels = Some(labels);

        match action {
            Action::Skip => {}
            Action::Create => self.create(obj, &target).await?,
            Action::Update => self.update(obj, &target).await?,
        }
        Ok(Some(target))
    }

    async fn create(&self, mut obj: DynamicObject, target: &ResourceSpec) -> Result<(), Error> {
        obj.metadata.resource_version = None;
        let result = if self.server_side_apply {
            self.client.apply(obj).await
        } else {
            self.client.create(obj).await
        };
        match result {
            Ok(_) => {
                tracing::info!(%target, "Created generated resource");
                Ok(())
            }
            Err(error) if error.is_already_exists() => {
                tracing::debug!(%target, "Generated resource already exists");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn update(&self, obj: DynamicObject, target: &ResourceSpec) -> Result<(), Error> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = match self
                .client
                .get(&target.api_version, &target.kind, &target.namespace, &target.name)
                .await
            {
                Ok(existing) => existing,
                Err(error) => {
                    tracing::debug!(%target, %error, "Target vanished; creating it");
                    return self.create(obj, target).await;
                }
            };

            if !self.synchronize {
                tracing::debug!(%target, "Synchronize is disabled; leaving target unchanged");
                return Ok(());
            }

            if equivalent(&existing, &obj)? {
                tracing::debug!(%target, "Generated resource is up to date");
                return Ok(());
            }

            let mut obj = obj.clone();
            if let Some(types) = obj.types.as_mut() {
                if types.api_version.is_empty() {
                    if let Some(current) = existing.types.as_ref() {
                        types.api_version = current.api_version.clone();
                    }
                }
            }
            if obj.metadata.namespace.is_none() {
                obj.metadata.namespace = existing.metadata.namespace.clone();
            }
            obj.metadata.resource_version = existing.metadata.resource_version.clone();

            let result = if self.server_side_apply {
                self.client.apply(obj).await
            } else {
                self.client.update(obj).await
            };
            match result {
                Ok(_) => {
                    tracing::info!(%target, "Updated generated resource");
                    return Ok(());
                }
                Err(error) if error.is_conflict() => {
                    tracing::debug!(%target, "Conflict updating generated resource; retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(anyhow::anyhow!(
            "failed to update {target} after {MAX_CONFLICT_RETRIES} conflicting writes"
        )
        .into())
    }
}

/// Resolves variable references in a template.
pub(crate) fn substitute_template(
    engine: &dyn Engine,
    ctx: &PolicyContext,
    template: &Template,
) -> Result<Template, Error> {
    let sub = |s: &str| substitute_str(engine, ctx, s);
    let t = &template.target;
    let target = ResourceSpec {
        api_version: sub(&t.api_version)?,
        kind: sub(&t.kind)?,
        namespace: sub(&t.namespace)?,
        name: sub(&t.name)?,
        uid: t.uid.clone(),
    };

    let source = match &template.source {
        Source::Data(data) => Source::Data(engine.substitute(ctx, data)?),
        Source::Clone(from) => Source::Clone(CloneFrom {
            namespace: sub(&from.namespace)?,
            name: sub(&from.name)?,
        }),
        Source::CloneList(list) => {
            let selector = match list.selector.as_ref() {
                Some(selector) => {
                    let value = serde_json::to_value(selector).map_err(anyhow::Error::from)?;
                    let value = engine.substitute(ctx, &value)?;
                    Some(serde_json::from_value(value).map_err(anyhow::Error::from)?)
                }
                None => None,
            };
            Source::CloneList(CloneList {
                namespace: sub(&list.namespace)?,
                kinds: list
                    .kinds
                    .iter()
                    .map(|k| sub(k))
                    .collect::<Result<_, _>>()?,
                selector,
            })
        }
    };

    Ok(Template { target, source })
}

fn substitute_str(engine: &dyn Engine, ctx: &PolicyContext, s: &str) -> Result<String, Error> {
    if !s.contains("{{") {
        return Ok(s.to_string());
    }
    match engine.substitute(ctx, &Value::String(s.to_string()))? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}
