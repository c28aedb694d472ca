use generate_controller_core::k8s::{DynamicObject, ResourceSpec};
use std::fmt;

/// What the materializer should do with a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Skip,
    Create,
    Update,
}

/// A strategy's decision for a single target.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateResponse {
    pub action: Action,
    /// The desired target object; `None` when skipping.
    pub data: Option<DynamicObject>,
    pub target: ResourceSpec,
    /// The clone source the data was copied from.
    pub source: Option<ResourceSpec>,
}

// === impl GenerateResponse ===

impl GenerateResponse {
    pub fn skip(target: ResourceSpec) -> Self {
        Self {
            action: Action::Skip,
            data: None,
            target,
            source: None,
        }
    }

    pub fn create(data: DynamicObject, target: ResourceSpec) -> Self {
        Self {
            action: Action::Create,
            data: Some(data),
            target,
            source: None,
        }
    }

    pub fn update(data: DynamicObject, target: ResourceSpec) -> Self {
        Self {
            action: Action::Update,
            data: Some(data),
            target,
            source: None,
        }
    }

    pub fn with_source(mut self, source: ResourceSpec) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Create => "create",
            Self::Update => "update",
        };
        f.write_str(s)
    }
}
