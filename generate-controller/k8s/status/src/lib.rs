#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod events;
mod metrics;
mod status;

pub use self::{
    events::{publish_events, EventRecorder},
    metrics::ControllerMetrics,
    status::StatusControl,
};
