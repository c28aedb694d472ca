use crate::{
    context::PolicyContext,
    k8s::{policy::ContextEntry, ResourceSpec},
};
use anyhow::Result;
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleStatus {
    Pass,
    Fail,
    Error,
    Skip,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleResponse {
    pub name: String,
    pub status: RuleStatus,
    pub message: String,
}

/// The result of evaluating a policy's generate rules against a resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineResponse {
    pub policy: String,
    pub resource: ResourceSpec,
    pub rules: Vec<RuleResponse>,
}

/// Evaluates generate rules and resolves rule variables.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// Decides which of the context policy's generate rules apply to the
    /// context resource.
    async fn evaluate(&self, ctx: &PolicyContext) -> EngineResponse;

    /// Loads a rule's context entries into the JSON context.
    async fn load_context(&self, ctx: &mut PolicyContext, entries: &[ContextEntry]) -> Result<()>;

    /// Evaluates a list expression to the elements it selects.
    fn resolve_list(&self, ctx: &PolicyContext, expr: &str) -> Result<Vec<Value>>;

    /// Replaces variable references within a document.
    fn substitute(&self, ctx: &PolicyContext, value: &Value) -> Result<Value>;
}

// === impl RuleResponse ===

impl RuleResponse {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: RuleStatus::Pass,
            message: message.into(),
        }
    }

    pub fn skip(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: RuleStatus::Skip,
            message: message.into(),
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: RuleStatus::Error,
            message: message.into(),
        }
    }
}

// === impl EngineResponse ===

impl EngineResponse {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn passed(&self) -> impl Iterator<Item = &RuleResponse> {
        self.rules.iter().filter(|r| r.status == RuleStatus::Pass)
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Skip => "skip",
        };
        f.write_str(s)
    }
}
