//! A built-in [`Engine`] covering resource matching, variable substitution and
//! simple context variables.

use anyhow::{anyhow, bail, Context, Result};
use generate_controller_core::{
    k8s::{labels::Selector, policy::ContextEntry, ResourceSpec},
    pattern::wildcard_match,
    Engine, EngineResponse, PolicyContext, RuleResponse,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

static VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("variable pattern must compile"));

#[derive(Clone, Debug, Default)]
pub struct BasicEngine(());

/// The parts of a resource that `match` blocks select on.
struct Candidate<'a> {
    kind: &'a str,
    api_version: &'a str,
    name: &'a str,
    namespace: &'a str,
    labels: BTreeMap<String, String>,
}

// === impl BasicEngine ===

impl BasicEngine {
    pub fn new() -> Self {
        Self(())
    }
}

#[async_trait::async_trait]
impl Engine for BasicEngine {
    async fn evaluate(&self, ctx: &PolicyContext) -> EngineResponse {
        let resource = ctx.resource().cloned().unwrap_or(Value::Null);
        let candidate = Candidate::new(&resource);
        let mut response = EngineResponse {
            policy: ctx.policy.key(),
            resource: ResourceSpec::new(
                candidate.api_version,
                candidate.kind,
                candidate.namespace,
                candidate.name,
            )
            .with_uid(str_at(&resource, "/metadata/uid")),
            rules: Vec::new(),
        };

        for rule in ctx.policy.spec().rules.iter().filter(|r| r.has_generate()) {
            let matched = match rule.match_resources.as_ref() {
                None => true,
                Some(block) => candidate.matches_block(block),
            };
            let rule_response = if matched {
                RuleResponse::pass(&rule.name, "rule matched")
            } else {
                RuleResponse::skip(&rule.name, "rule does not match the resource")
            };
            tracing::trace!(rule = %rule.name, status = %rule_response.status, "Evaluated rule");
            response.rules.push(rule_response);
        }
        response
    }

    async fn load_context(&self, ctx: &mut PolicyContext, entries: &[ContextEntry]) -> Result<()> {
        for entry in entries {
            let Some(variable) = entry.variable.as_ref() else {
                bail!("context entry {} has no supported source", entry.name);
            };

            let value = match (variable.value.as_ref(), variable.jmes_path.as_deref()) {
                (Some(value), _) => Some(self.substitute(ctx, value)?),
                (None, Some(path)) => ctx.json.query(path.trim()).cloned(),
                (None, None) => None,
            };
            let value = match value.filter(|v| !v.is_null()) {
                Some(value) => value,
                None => match variable.default.as_ref() {
                    Some(default) => self.substitute(ctx, default)?,
                    None => bail!("context entry {} evaluated to null", entry.name),
                },
            };
            ctx.json.add(&entry.name, value);
        }
        Ok(())
    }

    fn resolve_list(&self, ctx: &PolicyContext, expr: &str) -> Result<Vec<Value>> {
        let path = expr
            .trim()
            .trim_start_matches("{{")
            .trim_end_matches("}}")
            .trim();
        match ctx.json.query(path) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(other) => bail!("{path} is not a list: {other}"),
        }
    }

    fn substitute(&self, ctx: &PolicyContext, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => substitute_string(ctx, s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.substitute(ctx, v))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    let k = match substitute_string(ctx, k)? {
                        Value::String(k) => k,
                        other => other.to_string(),
                    };
                    out.insert(k, self.substitute(ctx, v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

fn substitute_string(ctx: &PolicyContext, s: &str) -> Result<Value> {
    if let Some(caps) = VARIABLE.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            return lookup(ctx, &caps[1]).cloned();
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in VARIABLE.captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&s[last..m.start()]);
        match lookup(ctx, &caps[1])? {
            Value::String(v) => out.push_str(v),
            Value::Null => {}
            v => out.push_str(&v.to_string()),
        }
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn lookup<'c>(ctx: &'c PolicyContext, path: &str) -> Result<&'c Value> {
    ctx.json
        .query(path)
        .ok_or_else(|| anyhow!("variable {path} is not defined"))
        .with_context(|| format!("failed to substitute {{{{{path}}}}}"))
}

fn str_at<'v>(value: &'v Value, pointer: &str) -> &'v str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

// === impl Candidate ===

impl<'a> Candidate<'a> {
    fn new(resource: &'a Value) -> Self {
        let labels = resource
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            kind: str_at(resource, "/kind"),
            api_version: str_at(resource, "/apiVersion"),
            name: str_at(resource, "/metadata/name"),
            namespace: str_at(resource, "/metadata/namespace"),
            labels,
        }
    }

    /// Evaluates a `match` block: `resources` and every `all[]` entry must
    /// match, and at least one `any[]` entry must match when present.
    fn matches_block(&self, block: &Value) -> bool {
        if let Some(filter) = block.get("resources") {
            if !self.matches_filter(filter) {
                return false;
            }
        }
        let filters = |key: &str| {
            block
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("resources"))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        if !filters("all").into_iter().all(|f| self.matches_filter(f)) {
            return false;
        }
        let any = filters("any");
        any.is_empty() || any.into_iter().any(|f| self.matches_filter(f))
    }

    fn matches_filter(&self, filter: &Value) -> bool {
        let strings = |key: &str| {
            filter
                .get(key)
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                .unwrap_or_default()
        };

        let kinds = strings("kinds");
        if !kinds.is_empty() && !kinds.iter().any(|k| self.matches_kind(k)) {
            return false;
        }

        if let Some(name) = filter.get("name").and_then(Value::as_str) {
            if !wildcard_match(name, self.name) {
                return false;
            }
        }
        let names = strings("names");
        if !names.is_empty() && !names.iter().any(|n| wildcard_match(n, self.name)) {
            return false;
        }

        let namespaces = strings("namespaces");
        if !namespaces.is_empty() && !namespaces.iter().any(|n| wildcard_match(n, self.namespace))
        {
            return false;
        }

        if let Some(selector) = filter.get("selector") {
            match serde_json::from_value::<Selector>(selector.clone()) {
                Ok(selector) if selector.matches_map(&self.labels) => {}
                Ok(_) => return false,
                Err(error) => {
                    tracing::debug!(%error, "Ignoring invalid label selector");
                    return false;
                }
            }
        }
        true
    }

    /// Matches `Kind`, `version/Kind` or `group/version/Kind`, with wildcards
    /// permitted in each segment.
    fn matches_kind(&self, selector: &str) -> bool {
        let (prefix, kind) = match selector.rsplit_once('/') {
            Some((prefix, kind)) => (Some(prefix), kind),
            None => (None, selector),
        };
        if !wildcard_match(kind, self.kind) {
            return false;
        }
        match prefix {
            None => true,
            Some(prefix) if prefix.contains('/') => wildcard_match(prefix, self.api_version),
            Some(version) => {
                let (_, resource_version) =
                    generate_controller_core::k8s::split_api_version(self.api_version);
                wildcard_match(version, resource_version)
            }
        }
    }
}
