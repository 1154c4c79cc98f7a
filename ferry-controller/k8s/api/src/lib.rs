#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod traffic;
pub mod tunnel;

pub use self::{
    labels::Labels,
    traffic::{Hub, HubSpec, Route, RouteSpec, RouteStatus},
};
pub use k8s_openapi::{
    api::core::v1::{ConfigMap, Namespace, Secret, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{
        apis::meta::v1::{Condition, Time},
        util::intstr::IntOrString,
    },
    ByteString,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};
