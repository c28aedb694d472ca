#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use generate_controller_background as background;
pub use generate_controller_core as core;
pub use generate_controller_core::k8s;
pub use generate_controller_k8s_client as client;
pub use generate_controller_k8s_index as index;
pub use generate_controller_k8s_status as status;

mod args;
mod lease;
mod metrics;
mod queue;
mod sync;
mod worker;

pub use self::{
    args::Args,
    metrics::ReconcileMetrics,
    queue::WorkQueue,
    sync::{Lifecycle, Process, Syncer, UpdateRequests},
};
