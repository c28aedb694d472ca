//! Reconciles a single update request.

use crate::{
    cleanup::{self, Outcome},
    generator::{substitute_template, Generator},
    Error, Errors,
};
use generate_controller_core::{
    k8s::{
        policy::{AnyPolicy, ApplyRules, Generation},
        update_request::{Operation, RuleContext},
        ResourceExt, ResourceSpec, UpdateRequest, UpdateRequestState,
    },
    provenance::{self, RuleRef},
    generate::{Source, Template},
    Engine, Event, EventSink, GenerationSpec, PolicyContext, PolicyLister, Reason, ReportWriter,
    ResourceClient, StatusStore,
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

/// Variables that are only populated while handling an admission request and
/// are therefore unavailable when a rule is re-evaluated in the background.
const ADMISSION_ONLY_VARIABLES: [&str; 5] = [
    "request.userInfo",
    "request.roles",
    "request.clusterRoles",
    "serviceAccountName",
    "serviceAccountNamespace",
];

#[derive(Clone)]
pub struct GenerateController {
    client: Arc<dyn ResourceClient>,
    engine: Arc<dyn Engine>,
    policies: Arc<dyn PolicyLister>,
    statuses: Arc<dyn StatusStore>,
    events: Arc<dyn EventSink>,
    reports: Option<Arc<dyn ReportWriter>>,
}

/// The result of processing one rule context.
#[derive(Debug, Default)]
struct RuleOutcome {
    generated: Vec<ResourceSpec>,
    /// True if the rule applied to the trigger or cleaned up after it.
    applied: bool,
    error: Option<Error>,
}

// === impl GenerateController ===

impl GenerateController {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        engine: Arc<dyn Engine>,
        policies: Arc<dyn PolicyLister>,
        statuses: Arc<dyn StatusStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            engine,
            policies,
            statuses,
            events,
            reports: None,
        }
    }

    pub fn with_reports(mut self, reports: Arc<dyn ReportWriter>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Processes every rule context of an update request and records the
    /// outcome in its status.
    ///
    /// Rule contexts are processed in order and independently: a failure in one
    /// does not prevent the others from running. An error is returned only if
    /// the status could not be written.
    pub async fn process_update_request(
        &self,
        ur: &UpdateRequest,
    ) -> anyhow::Result<UpdateRequestState> {
        let name = ur.name_any();
        let prior = ur.generated_resources();
        tracing::debug!(%name, policy = %ur.spec.policy, rules = ur.spec.rule_context.len(), "Processing update request");

        let Some(policy) = self.policies.get(&ur.spec.policy) else {
            tracing::info!(%name, policy = %ur.spec.policy, "Policy not found; cleaning up downstream resources");
            let outcome = cleanup::delete_all(&*self.client, prior).await;
            return self.record_cleanup(&name, outcome).await;
        };

        // A policy that is being deleted only cleans up after itself.
        let terminating = policy.is_terminating();

        let mut errors = Errors::default();
        let mut applied = false;
        let mut generated = Vec::new();
        let mut records_deleted = false;

        for rc in &ur.spec.rule_context {
            if applied && policy.spec().apply_rules == Some(ApplyRules::One) {
                tracing::debug!(rule = %rc.rule, "Policy applies only one rule; skipping");
                break;
            }

            let outcome = if terminating || rc.delete_downstream || policy.rule(&rc.rule).is_none() {
                let (outcome, deleted) = self
                    .cleanup_rule(&policy, rc, ur, terminating, records_deleted)
                    .await;
                records_deleted |= deleted;
                outcome
            } else {
                self.generate_rule(&policy, rc, ur).await
            };

            applied |= outcome.applied;
            generated.extend(outcome.generated);
            if let Some(error) = outcome.error {
                tracing::info!(%name, rule = %rc.rule, %error, "Rule failed");
                self.events.emit(Event {
                    policy: policy.key(),
                    rule: rc.rule.clone(),
                    reason: Reason::PolicyError,
                    message: error.to_string(),
                    resource: rc.trigger.clone(),
                    source: None,
                });
                errors.push(error.in_rule(rc.rule.clone()));
            }
        }

        if !records_deleted {
            generated = prior.iter().cloned().chain(generated).collect();
        }
        let generated = dedup(generated);

        let status = if !errors.is_empty() {
            self.statuses
                .failed(&name, errors.to_string(), generated)
                .await
                .map(|_| UpdateRequestState::Failed)
        } else if !applied {
            self.statuses
                .skip(&name, generated)
                .await
                .map(|_| UpdateRequestState::Skip)
        } else {
            self.statuses
                .success(&name, generated)
                .await
                .map(|_| UpdateRequestState::Completed)
        };
        let state = status?;
        tracing::debug!(%name, %state, "Processed update request");
        Ok(state)
    }

    /// Deletes recorded downstream resources (at most once per request) or,
    /// when nothing was recorded, locates them by their provenance labels.
    ///
    /// Rules that orphan their downstream resources on policy deletion leave
    /// them in place while the policy terminates.
    async fn cleanup_rule(
        &self,
        policy: &AnyPolicy,
        rc: &RuleContext,
        ur: &UpdateRequest,
        terminating: bool,
        records_deleted: bool,
    ) -> (RuleOutcome, bool) {
        let spec = policy
            .rule(&rc.rule)
            .and_then(|r| r.generate.as_ref())
            .map(GenerationSpec::try_from);
        if terminating && matches!(spec, Some(Ok(ref s)) if s.orphan_downstream_on_policy_delete) {
            tracing::info!(rule = %rc.rule, "Policy is being deleted; orphaning downstream resources");
            return (
                RuleOutcome {
                    applied: true,
                    ..Default::default()
                },
                false,
            );
        }

        let prior = ur.generated_resources();
        let outcome = if !prior.is_empty() {
            if records_deleted {
                return (
                    RuleOutcome {
                        applied: true,
                        ..Default::default()
                    },
                    true,
                );
            }
            cleanup::delete_all(&*self.client, prior).await
        } else {
            let Some(spec) = spec else {
                tracing::debug!(rule = %rc.rule, "Rule not found; nothing to clean up");
                return (RuleOutcome::default(), false);
            };
            match spec {
                Ok(spec) => {
                    let rule = RuleRef::new(policy, rc.rule.clone());
                    let templates = self.cleanup_templates(policy, rc, ur, &spec).await;
                    cleanup::delete_downstream(&*self.client, &rule, &templates, &rc.trigger).await
                }
                Err(error) => Outcome {
                    errors: Error::InvalidRule {
                        rule: rc.rule.clone(),
                        error,
                    }
                    .into(),
                    ..Default::default()
                },
            }
        };

        let error = outcome.errors.into_error().err();
        let result = RuleOutcome {
            generated: outcome.failed,
            applied: true,
            error,
        };
        (result, !prior.is_empty())
    }

    /// Resolves the variables of a rule's templates against the trigger so
    /// that clone sources can be located. Templates whose clone source cannot
    /// be resolved are left out.
    async fn cleanup_templates(
        &self,
        policy: &AnyPolicy,
        rc: &RuleContext,
        ur: &UpdateRequest,
        spec: &GenerationSpec,
    ) -> Vec<Template> {
        let info = &ur.spec.context.admission_request_info;
        let resource = match info.object().or(info.old_object()) {
            Some(obj) => Some(obj.clone()),
            None => self.fetch_trigger(&rc.trigger).await.ok(),
        };
        let ctx = PolicyContext::new(
            policy.clone(),
            resource,
            None,
            info.operation.unwrap_or(Operation::Create),
            ur.spec.context.user_info.clone(),
        );

        let mut templates = Vec::new();
        for template in spec.templates() {
            match substitute_template(&*self.engine, &ctx, template) {
                Ok(template) => templates.push(template),
                Err(error) if matches!(template.source, Source::Clone(_)) => {
                    tracing::warn!(rule = %rc.rule, %error, "Cannot resolve the clone source; skipping");
                }
                // Only the target kind and the trigger locate other templates.
                Err(_) => templates.push(template.clone()),
            }
        }
        templates
    }

    async fn generate_rule(
        &self,
        policy: &AnyPolicy,
        rc: &RuleContext,
        ur: &UpdateRequest,
    ) -> RuleOutcome {
        match self.try_generate_rule(policy, rc, ur).await {
            Ok(outcome) => outcome,
            Err(error) => RuleOutcome {
                error: Some(error),
                ..Default::default()
            },
        }
    }

    async fn try_generate_rule(
        &self,
        policy: &AnyPolicy,
        rc: &RuleContext,
        ur: &UpdateRequest,
    ) -> Result<RuleOutcome, Error> {
        let Some(single) = policy.with_only_rule(&rc.rule) else {
            return Ok(RuleOutcome::default());
        };
        let Some(rule) = single.rule(&rc.rule).cloned() else {
            return Ok(RuleOutcome::default());
        };
        let Some(generation) = rule.generate.as_ref() else {
            tracing::debug!(rule = %rc.rule, "Rule does not generate resources");
            return Ok(RuleOutcome::default());
        };
        let spec = GenerationSpec::try_from(generation).map_err(|error| Error::InvalidRule {
            rule: rc.rule.clone(),
            error,
        })?;

        if spec.synchronize {
            warn_admission_variables(&rc.rule, generation);
        }

        let (new_resource, old_resource) = self.resolve_trigger(ur, rc).await?;
        let trigger = trigger_spec(new_resource.as_ref().or(old_resource.as_ref()), &rc.trigger);
        let operation = ur
            .spec
            .context
            .admission_request_info
            .operation
            .unwrap_or(Operation::Create);
        let mut ctx = PolicyContext::new(
            single,
            new_resource,
            old_resource,
            operation,
            ur.spec.context.user_info.clone(),
        );

        let response = self.engine.evaluate(&ctx).await;
        if let Some(reports) = self.reports.as_ref() {
            if let Err(error) = reports.write(&response).await {
                tracing::warn!(%error, resource = %response.resource, "Failed to write report");
            }
        }
        if !response.passed().any(|r| r.name == rc.rule) {
            tracing::debug!(rule = %rc.rule, %trigger, "Rule does not apply to the trigger");
            return Ok(RuleOutcome::default());
        }

        self.engine
            .load_context(&mut ctx, &rule.context)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load rule context: {e}"))?;

        let generator = Generator {
            client: &*self.client,
            engine: &*self.engine,
            rule: RuleRef::new(policy, rc.rule.clone()),
            trigger: trigger.clone(),
            synchronize: spec.synchronize,
            server_side_apply: policy.spec().use_server_side_apply,
            has_prior: !ur.generated_resources().is_empty(),
        };
        let (generated, result) = generator.apply(&mut ctx, &spec).await;

        for target in &generated {
            self.events.emit(Event {
                policy: policy.key(),
                rule: rc.rule.clone(),
                reason: Reason::PolicyApplied,
                message: format!("resource {target} generated"),
                resource: target.clone(),
                source: Some(trigger.clone()),
            });
        }

        Ok(RuleOutcome {
            generated,
            applied: true,
            error: result.err(),
        })
    }

    /// Determines the new and old state of the trigger.
    async fn resolve_trigger(
        &self,
        ur: &UpdateRequest,
        rc: &RuleContext,
    ) -> Result<(Option<Value>, Option<Value>), Error> {
        let info = &ur.spec.context.admission_request_info;
        if info.admission_request.is_none() {
            return Ok((Some(self.fetch_trigger(&rc.trigger).await?), None));
        }

        match info.operation.unwrap_or(Operation::Create) {
            Operation::Delete => match info.old_object() {
                Some(old) if !carries_provenance(old) => Ok((None, Some(old.clone()))),
                _ => Ok((Some(self.fetch_trigger(&rc.trigger).await?), None)),
            },
            Operation::Create => match self.fetch_trigger(&rc.trigger).await {
                Ok(obj) => Ok((Some(obj), None)),
                Err(error) => match (info.sub_resource(), info.object()) {
                    (Some(_), Some(obj)) => Ok((Some(obj.clone()), None)),
                    _ => Err(error),
                },
            },
            _ => match info.object().or(info.old_object()) {
                Some(obj) => Ok((Some(obj.clone()), None)),
                None => Ok((Some(self.fetch_trigger(&rc.trigger).await?), None)),
            },
        }
    }

    async fn fetch_trigger(&self, trigger: &ResourceSpec) -> Result<Value, Error> {
        let not_found = || Error::Trigger {
            trigger: trigger.to_string(),
            reason: "not found".to_string(),
        };
        let obj = match self
            .client
            .get(&trigger.api_version, &trigger.kind, &trigger.namespace, &trigger.name)
            .await
        {
            Ok(obj) => obj,
            Err(error) if error.is_not_found() => return Err(not_found()),
            Err(error) => {
                return Err(Error::Trigger {
                    trigger: trigger.to_string(),
                    reason: error.to_string(),
                })
            }
        };
        if !trigger.uid.is_empty() && obj.uid().as_deref() != Some(trigger.uid.as_str()) {
            tracing::debug!(%trigger, "Trigger was replaced");
            return Err(not_found());
        }
        serde_json::to_value(&obj).map_err(|e| Error::Other(e.into()))
    }

    async fn record_cleanup(
        &self,
        name: &str,
        outcome: Outcome,
    ) -> anyhow::Result<UpdateRequestState> {
        if outcome.errors.is_empty() {
            self.statuses.success(name, Vec::new()).await?;
            return Ok(UpdateRequestState::Completed);
        }
        self.statuses
            .failed(name, outcome.errors.to_string(), outcome.failed)
            .await?;
        Ok(UpdateRequestState::Failed)
    }
}

fn carries_provenance(obj: &Value) -> bool {
    let labels = obj
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();
    provenance::is_generated(&labels)
}

/// Identifies the trigger from its resolved state, falling back to the
/// request's record of it.
fn trigger_spec(obj: Option<&Value>, recorded: &ResourceSpec) -> ResourceSpec {
    let field = |pointer: &str, fallback: &str| {
        obj.and_then(|o| o.pointer(pointer))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    ResourceSpec {
        api_version: field("/apiVersion", &recorded.api_version),
        kind: field("/kind", &recorded.kind),
        namespace: field("/metadata/namespace", &recorded.namespace),
        name: field("/metadata/name", &recorded.name),
        uid: field("/metadata/uid", &recorded.uid),
    }
}

fn warn_admission_variables(rule: &str, generation: &Generation) {
    let Ok(text) = serde_json::to_string(generation) else {
        return;
    };
    for var in ADMISSION_ONLY_VARIABLES {
        if text.contains(var) {
            tracing::warn!(
                %rule,
                variable = var,
                "Synchronized rule references a variable that is only available at admission; \
                 downstream resources may not be regenerated"
            );
        }
    }
}

fn dedup(specs: Vec<ResourceSpec>) -> Vec<ResourceSpec> {
    let mut out: Vec<ResourceSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        if !out.iter().any(|s| s.same_target(&spec)) {
            out.push(spec);
        }
    }
    out
}
