//! Ferry hub index.
//!
//! Tracks every hub of the federation as seen from the control cluster:
//!
//! - Each `Hub` declares its default gateway and per-peer overrides.
//! - Each hub's `Secret` in the control namespace holds the kubeconfig used to
//!   reach it and the SSH key it is authorized with.
//! - Once reachable, each hub's Services are cached by an informer so that
//!   routes can resolve the ports of the services they export.
//!
//! ```text
//! [ Hub ] + [ Secret ] -> [ Registry ] -> Init -> [ Initializer ] -> client, informer, ports
//! ```
//!
//! Controllers consume the registry through the [`Hubs`] trait, which also
//! carries the ConfigMap API calls made against hubs.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod debounce;
mod gateway;
pub mod ports;
mod registry;


pub use self::registry::{
    ClusterInfo, Init, Initializer, Registry, SharedRegistry, AUTHORIZED_KEY, KUBECONFIG_KEY,
};
use ferry_controller_core::{Gateway, PortError, PortPeer};
use ferry_controller_k8s_api::{ConfigMap, Service};

/// Hub lookups and the API calls controllers make against hubs.
#[async_trait::async_trait]
pub trait Hubs: Send + Sync + 'static {
    /// True once the hub's client is built and its tunnel namespace was seen.
    fn hub_ready(&self, hub: &str) -> bool;

    /// The gateway of `hub` as seen by `for_hub`. Unknown hubs are
    /// unreachable.
    fn gateway(&self, hub: &str, for_hub: &str) -> Gateway;

    /// The SSH public key a hub authenticates with.
    fn authorized(&self, hub: &str) -> Option<String>;

    fn get_service(&self, hub: &str, namespace: &str, name: &str) -> Option<Service>;

    /// Returns the bind port of `peer` on the `import` hub, allocating one if
    /// needed.
    fn get_port_peer(&self, import: &str, peer: &PortPeer) -> Result<u16, PortError>;

    fn load_port_peer(&self, import: &str, peers: ports::Peers) -> Result<(), PortError>;

    fn delete_port_peer(&self, import: &str, peer: &PortPeer) -> Option<u16>;

    /// Fires `trigger` whenever a Service changes on the `export` hub.
    fn register_service_callback(&self, export: &str, import: &str, trigger: debounce::Trigger);

    fn unregister_service_callback(&self, export: &str, import: &str);

    async fn list_config_maps(&self, hub: &str, selector: &str) -> anyhow::Result<Vec<ConfigMap>>;

    /// Creates or updates a ConfigMap in the hub's tunnel namespace.
    async fn apply_config_map(&self, hub: &str, cm: &ConfigMap) -> anyhow::Result<()>;

    /// Deletes a ConfigMap from the hub's tunnel namespace. Missing
    /// ConfigMaps are not an error.
    async fn delete_config_map(&self, hub: &str, name: &str) -> anyhow::Result<()>;
}
