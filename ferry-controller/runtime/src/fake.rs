//! An in-memory federation that records every ConfigMap API call.

use crate::{
    core::{Gateway, PortAllocator, PortError, PortPeer},
    index::{debounce, ports, Hubs},
    k8s::{
        traffic::{RouteSpecRule, RouteSpecRuleService},
        ConfigMap, ObjectMeta, ResourceExt, Route, RouteSpec, Service, ServicePort, ServiceSpec,
    },
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Apply(String, String),
    Delete(String, String),
}

#[derive(Default)]
pub(crate) struct FakeHubs {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    ready: HashSet<String>,
    gateways: HashMap<String, Gateway>,
    services: HashMap<(String, String, String), Service>,
    allocators: HashMap<String, PortAllocator>,
    callbacks: HashMap<(String, String), debounce::Trigger>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    failing: HashSet<String>,
    calls: Vec<Call>,
}

impl FakeHubs {
    /// Adds a ready hub.
    pub(crate) fn hub(&self, name: &str, gateway: Gateway) {
        let mut state = self.state.lock();
        state.ready.insert(name.to_string());
        state.gateways.insert(name.to_string(), gateway);
    }

    pub(crate) fn set_ready(&self, name: &str, ready: bool) {
        let mut state = self.state.lock();
        if ready {
            state.ready.insert(name.to_string());
        } else {
            state.ready.remove(name);
        }
    }

    /// Makes every API call against `hub` fail.
    pub(crate) fn set_failing(&self, hub: &str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(hub.to_string());
        } else {
            state.failing.remove(hub);
        }
    }

    pub(crate) fn service(&self, hub: &str, namespace: &str, name: &str, ports: &[(&str, i32)]) {
        let svc = Service {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|(protocol, port)| ServicePort {
                            protocol: Some(protocol.to_string()),
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state.lock().services.insert(
            (hub.to_string(), namespace.to_string(), name.to_string()),
            svc,
        );
    }

    pub(crate) fn remove_service(&self, hub: &str, namespace: &str, name: &str) {
        self.state.lock().services.remove(&(
            hub.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
    }

    /// Stores a ConfigMap without recording a call, as if a previous run
    /// created it.
    pub(crate) fn put_config_map(&self, hub: &str, cm: ConfigMap) {
        self.state
            .lock()
            .config_maps
            .insert((hub.to_string(), cm.name_any()), cm);
    }

    pub(crate) fn config_map(&self, hub: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .config_maps
            .get(&(hub.to_string(), name.to_string()))
            .cloned()
    }

    /// The names of the ConfigMaps on `hub`.
    pub(crate) fn config_maps(&self, hub: &str) -> Vec<String> {
        self.state
            .lock()
            .config_maps
            .keys()
            .filter(|(h, _)| h == hub)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Replaces the port allocator of an import hub.
    pub(crate) fn allocator(&self, import: &str, allocator: PortAllocator) {
        self.state
            .lock()
            .allocators
            .insert(import.to_string(), allocator);
    }

    pub(crate) fn lookup_port(&self, import: &str, peer: &PortPeer) -> Option<u16> {
        self.state.lock().allocators.get(import)?.lookup(peer)
    }

    pub(crate) fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state.lock().calls)
    }

    pub(crate) fn has_callback(&self, export: &str, import: &str) -> bool {
        self.state
            .lock()
            .callbacks
            .contains_key(&(export.to_string(), import.to_string()))
    }

    fn check(&self, hub: &str) -> anyhow::Result<()> {
        if self.state.lock().failing.contains(hub) {
            anyhow::bail!("hub {hub} is unavailable");
        }
        Ok(())
    }
}

/// A route in `ferry-system` publishing `test/<service>` of `export` as
/// `default/<service>` of `import`.
pub(crate) fn route(name: &str, export: &str, import: &str, service: &str) -> Route {
    let rule = |hub: &str, namespace: &str| RouteSpecRule {
        hub_name: hub.to_string(),
        service: RouteSpecRuleService {
            namespace: namespace.to_string(),
            name: service.to_string(),
        },
    };
    let mut route = Route::new(
        name,
        RouteSpec {
            export: rule(export, "test"),
            import: rule(import, "default"),
        },
    );
    route.metadata.namespace = Some("ferry-system".to_string());
    route
}

#[async_trait::async_trait]
impl Hubs for FakeHubs {
    fn hub_ready(&self, hub: &str) -> bool {
        self.state.lock().ready.contains(hub)
    }

    fn gateway(&self, hub: &str, _: &str) -> Gateway {
        self.state
            .lock()
            .gateways
            .get(hub)
            .cloned()
            .unwrap_or_default()
    }

    fn authorized(&self, hub: &str) -> Option<String> {
        self.state
            .lock()
            .gateways
            .contains_key(hub)
            .then(|| format!("ssh-ed25519 {hub}"))
    }

    fn get_service(&self, hub: &str, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .services
            .get(&(hub.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn get_port_peer(&self, import: &str, peer: &PortPeer) -> Result<u16, PortError> {
        self.state
            .lock()
            .allocators
            .entry(import.to_string())
            .or_default()
            .get(peer)
    }

    fn load_port_peer(&self, import: &str, peers: ports::Peers) -> Result<(), PortError> {
        self.state
            .lock()
            .allocators
            .entry(import.to_string())
            .or_default()
            .load(peers)
    }

    fn delete_port_peer(&self, import: &str, peer: &PortPeer) -> Option<u16> {
        self.state
            .lock()
            .allocators
            .get_mut(import)?
            .delete(peer)
    }

    fn register_service_callback(&self, export: &str, import: &str, trigger: debounce::Trigger) {
        self.state
            .lock()
            .callbacks
            .insert((export.to_string(), import.to_string()), trigger);
    }

    fn unregister_service_callback(&self, export: &str, import: &str) {
        self.state
            .lock()
            .callbacks
            .remove(&(export.to_string(), import.to_string()));
    }

    async fn list_config_maps(&self, hub: &str, selector: &str) -> anyhow::Result<Vec<ConfigMap>> {
        self.check(hub)?;
        let selector = selector
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .collect::<Vec<_>>();
        Ok(self
            .state
            .lock()
            .config_maps
            .iter()
            .filter(|((h, _), cm)| {
                h == hub
                    && selector
                        .iter()
                        .all(|(k, v)| cm.labels().get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn apply_config_map(&self, hub: &str, cm: &ConfigMap) -> anyhow::Result<()> {
        self.check(hub)?;
        let mut state = self.state.lock();
        state
            .calls
            .push(Call::Apply(hub.to_string(), cm.name_any()));
        state
            .config_maps
            .insert((hub.to_string(), cm.name_any()), cm.clone());
        Ok(())
    }

    async fn delete_config_map(&self, hub: &str, name: &str) -> anyhow::Result<()> {
        self.check(hub)?;
        let mut state = self.state.lock();
        state
            .calls
            .push(Call::Delete(hub.to_string(), name.to_string()));
        state
            .config_maps
            .remove(&(hub.to_string(), name.to_string()));
        Ok(())
    }
}
