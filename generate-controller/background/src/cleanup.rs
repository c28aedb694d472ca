//! Removal of downstream resources when a policy, rule, trigger or clone
//! source goes away.

use crate::{Error, Errors};
use generate_controller_core::{
    generate::{Source, Template},
    k8s::{labels::Selector, ResourceSpec},
    provenance::{self, RuleRef},
    ResourceClient,
};

/// The outcome of a cleanup pass.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Resources that could not be deleted and should be retried.
    pub failed: Vec<ResourceSpec>,
    pub errors: Errors,
}

// === impl Outcome ===

impl Outcome {
    fn merge(&mut self, other: Outcome) {
        self.failed.extend(other.failed);
        self.errors.extend(other.errors);
    }
}

/// Deletes each resource. Resources that are already gone count as deleted.
pub async fn delete_all(client: &dyn ResourceClient, resources: &[ResourceSpec]) -> Outcome {
    let mut outcome = Outcome::default();
    for spec in resources {
        match client
            .delete(&spec.api_version, &spec.kind, &spec.namespace, &spec.name)
            .await
        {
            Ok(()) => tracing::info!(resource = %spec, "Deleted downstream resource"),
            Err(error) if error.is_not_found() => {
                tracing::debug!(resource = %spec, "Downstream resource already deleted")
            }
            Err(error) => {
                tracing::warn!(resource = %spec, %error, "Failed to delete downstream resource");
                outcome.failed.push(spec.clone());
                outcome.errors.push(error.into());
            }
        }
    }
    outcome
}

/// Locates the resources a rule generated for a trigger by their provenance
/// labels and deletes them.
///
/// Clone rules are located by source: the configured clone source, or, for
/// clone lists, the trigger itself. Data rules are located by trigger.
/// Templates are expected to have their variables substituted.
pub async fn delete_downstream(
    client: &dyn ResourceClient,
    rule: &RuleRef,
    templates: &[Template],
    trigger: &ResourceSpec,
) -> Outcome {
    let mut outcome = Outcome::default();
    for template in templates {
        let (kind, selector) = match &template.source {
            Source::Data(_) => (
                (&template.target.api_version, &template.target.kind),
                provenance::trigger_selector(rule, trigger),
            ),
            Source::Clone(from) => {
                let source = ResourceSpec::new(
                    template.target.api_version.clone(),
                    template.target.kind.clone(),
                    from.namespace.clone(),
                    from.name.clone(),
                );
                (
                    (&template.target.api_version, &template.target.kind),
                    provenance::source_selector(rule, &source),
                )
            }
            Source::CloneList(_) => (
                (&trigger.api_version, &trigger.kind),
                provenance::source_selector(rule, trigger),
            ),
        };
        let (api_version, kind) = kind;
        outcome.merge(delete_selected(client, api_version, kind, &selector).await);
    }
    outcome
}

async fn delete_selected(
    client: &dyn ResourceClient,
    api_version: &str,
    kind: &str,
    selector: &Selector,
) -> Outcome {
    let downstream = match client.list(api_version, kind, "", selector).await {
        Ok(downstream) => downstream,
        Err(error) => {
            tracing::warn!(%kind, %selector, %error, "Failed to list downstream resources");
            let mut outcome = Outcome::default();
            outcome.errors.push(Error::List {
                kind: kind.to_string(),
                namespace: String::new(),
                error,
            });
            return outcome;
        }
    };
    tracing::debug!(%kind, %selector, found = downstream.len(), "Located downstream resources");

    let specs = downstream
        .iter()
        .map(|obj| {
            let mut spec = ResourceSpec::from_object(obj);
            if spec.api_version.is_empty() {
                spec.api_version = api_version.to_string();
            }
            if spec.kind.is_empty() {
                spec.kind = kind.to_string();
            }
            spec.uid.clear();
            spec
        })
        .collect::<Vec<_>>();
    delete_all(client, &specs).await
}
