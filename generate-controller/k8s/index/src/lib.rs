//! Indexes of the cluster state the generate controller reacts to.
//!
//! - Every `Policy` and `ClusterPolicy` with a generate rule is held in a
//!   [`PolicyIndex`] so that reconciliation can look policies up by key
//!   without a round-trip.
//! - Generate `UpdateRequest`s in the controller's namespace are held in an
//!   [`UpdateRequestIndex`], which feeds the name of each changed request to
//!   the work queue.
//!
//! Both are updated by `kubert` watch tasks and may be wrapped in
//! [`IndexMetrics`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod policy;
mod update_request;


pub use self::{
    metrics::{IndexMetrics, SizedIndex},
    policy::{PolicyIndex, PolicyReader, SharedPolicyIndex},
    update_request::{SharedUpdateRequestIndex, UpdateRequestIndex},
};
