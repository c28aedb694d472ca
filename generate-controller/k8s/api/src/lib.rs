#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;
mod resource_spec;
pub mod update_request;

pub use self::{
    labels::Labels,
    policy::{ClusterPolicy, Policy},
    resource_spec::{split_api_version, ResourceSpec},
    update_request::{UpdateRequest, UpdateRequestState, UpdateRequestStatus},
};
pub use k8s_openapi::{
    api::{self, core::v1::Namespace},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::core::{
    ApiResource, DynamicObject, GroupVersion, GroupVersionKind, ObjectMeta, ResourceExt, TypeMeta,
};
pub use serde_json::Value;
