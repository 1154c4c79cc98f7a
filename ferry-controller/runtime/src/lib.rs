//! The Ferry control plane.
//!
//! Routes are grouped by the pair of hubs they join. Each pair is driven by a
//! [`mapping`] controller that solves the way between the two hubs, builds
//! the tunnel chains of every route and converges the tunnel ConfigMaps of
//! every hub on the way.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use ferry_controller_core as core;
pub use ferry_controller_k8s_api as k8s;
pub use ferry_controller_k8s_index as index;
pub use ferry_controller_k8s_status as status;

mod args;
mod index_list;
pub mod mapping;
pub mod metrics;
pub mod render;
pub mod route;

#[cfg(test)]
mod fake;

pub use self::args::Args;
