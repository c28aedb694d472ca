use crate::{engine::EngineResponse, k8s::ResourceSpec};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    PolicyApplied,
    PolicyError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Normal,
    Warning,
}

/// A record of something the controller did on behalf of a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// The policy key.
    pub policy: String,
    pub rule: String,
    pub reason: Reason,
    pub message: String,
    /// The resource the event concerns.
    pub resource: ResourceSpec,
    /// The clone source, if any.
    pub source: Option<ResourceSpec>,
}

/// Accepts events for asynchronous delivery. Delivery is best-effort.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Persists per-resource evaluation results.
#[async_trait::async_trait]
pub trait ReportWriter: Send + Sync {
    async fn write(&self, response: &EngineResponse) -> anyhow::Result<()>;
}

// === impl Reason ===

impl Reason {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PolicyApplied => EventType::Normal,
            Self::PolicyError => EventType::Warning,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PolicyApplied => "PolicyApplied",
            Self::PolicyError => "PolicyError",
        };
        f.write_str(s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        };
        f.write_str(s)
    }
}
