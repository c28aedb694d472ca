#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod client;
pub mod context;
pub mod engine;
pub mod event;
pub mod generate;
pub mod pattern;
pub mod provenance;
pub mod store;

pub use generate_controller_k8s_api as k8s;

pub use self::{
    client::{ClientError, Discovery, ResolvedKind, ResourceClient},
    context::{JsonContext, PolicyContext},
    engine::{Engine, EngineResponse, RuleResponse, RuleStatus},
    event::{Event, EventSink, EventType, Reason, ReportWriter},
    generate::{GenerationSpec, InvalidGeneration, KindSelector},
    provenance::{Provenance, RuleRef},
    store::{PolicyLister, StatusStore},
};

pub const CONTROLLER_NAME: &str = "kyverno-generate-controller";
