//! Ferry routing engine.
//!
//! Everything in this crate is a pure function of the hub graph and the
//! route being built; the Kubernetes-facing crates feed it snapshots and
//! turn its results into ConfigMaps.
//!
//! ```text
//! [ way::solve ] -> [ chain::build ] -> { hub: Bound { outbound, inbound } }
//!                         ^
//!        [ ports::PortAllocator ] (bind port per import hub)
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod allow;
pub mod chain;
pub mod endpoint;
mod gateway;
pub mod ports;
pub mod way;

pub use self::{
    allow::{AllowList, Kind, Permission},
    chain::{Bound, Chain, ChainError, Tunnel},
    endpoint::{Endpoint, SshHop},
    gateway::{Gateway, Hop},
    ports::{PortAllocator, PortError, PortPeer},
};

/// A namespaced service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The in-cluster authority of one of this service's ports.
    pub fn authority(&self, port: u16) -> String {
        format!("{}.{}.svc:{}", self.name, self.namespace, port)
    }
}
