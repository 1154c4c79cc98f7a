//! Indexes hubs and the credentials used to reach them.
//!
//! The registry is updated by `Hub` and `Secret` watches on the control
//! cluster. Whenever a hub's kubeconfig is first seen or changes, an [`Init`]
//! is sent to the [`Initializer`], which builds the hub's client, recovers its
//! port assignments and starts its Service informer without holding the
//! registry lock. Every init carries a generation; results of stale inits are
//! discarded.

use crate::{debounce::Trigger, gateway, ports, Hubs};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use ferry_controller_core::{Gateway, PortAllocator, PortError, PortPeer};
use ferry_controller_k8s_api::{
    self as k8s, labels, watcher, ConfigMap, Hub, HubSpec, ResourceExt, Secret, Service,
};
use futures::prelude::*;
use kube::runtime::WatchStreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time,
};
use tracing::{info_span, Instrument};

/// The Secret key holding a hub's kubeconfig.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// The Secret key holding a hub's SSH public key.
pub const AUTHORIZED_KEY: &str = "authorized";

const FIELD_MANAGER: &str = "ferry-controller";

pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Holds control plane metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The namespace of `Hub` and `Route` objects and hub Secrets.
    pub namespace: String,

    /// The namespace the tunnel runs in on every hub.
    pub tunnel_namespace: String,

    pub port_start: u16,
    pub port_count: u16,
}

pub struct Registry {
    cluster_info: ClusterInfo,
    hubs: HashMap<String, HubState>,

    /// Bind port allocators, keyed by import hub. Kept across hub removal so
    /// that assignments survive a hub being recreated.
    allocators: HashMap<String, PortAllocator>,

    /// Service change callbacks keyed by `(export, import)`.
    callbacks: HashMap<(String, String), Trigger>,

    /// Notified whenever a hub changes.
    subscribers: Vec<Trigger>,

    inits: UnboundedSender<Init>,
    generations: u64,
}

/// Requests a hub's client be (re)built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Init {
    pub hub: String,
    pub generation: u64,
    pub kubeconfig: String,
}

/// Builds hub clients off the registry lock.
pub struct Initializer {
    registry: SharedRegistry,
    tx: UnboundedSender<Init>,
    rx: UnboundedReceiver<Init>,
    backoff: time::Duration,
}

type ServiceId = (String, String);

#[derive(Default)]
struct HubState {
    spec: Option<HubSpec>,
    kubeconfig: Option<String>,
    authorized: Option<String>,

    generation: u64,
    client: Option<k8s::Client>,
    services: HashMap<ServiceId, Service>,

    /// Services seen since the informer last (re)listed.
    relisting: Option<HashMap<ServiceId, Service>>,
    informer: Option<JoinHandle<()>>,
}

// === impl Registry ===

impl Registry {
    pub fn shared(cluster_info: ClusterInfo, inits: UnboundedSender<Init>) -> SharedRegistry {
        Arc::new(RwLock::new(Self {
            cluster_info,
            hubs: HashMap::default(),
            allocators: HashMap::default(),
            callbacks: HashMap::default(),
            subscribers: Vec::new(),
            inits,
            generations: 0,
        }))
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster_info
    }

    /// Registers a trigger fired whenever any hub changes.
    pub fn subscribe(&mut self, trigger: Trigger) {
        self.subscribers.push(trigger);
    }

    fn notify(&mut self) {
        self.subscribers.retain(|t| !t.is_closed());
        for trigger in &self.subscribers {
            trigger.trigger();
        }
    }

    fn notify_services(&self, export: &str) {
        for ((e, _), trigger) in &self.callbacks {
            if e == export {
                trigger.trigger();
            }
        }
    }

    fn allocator(&mut self, import: &str) -> &mut PortAllocator {
        let ClusterInfo {
            port_start,
            port_count,
            ..
        } = self.cluster_info;
        self.allocators
            .entry(import.to_string())
            .or_insert_with(|| PortAllocator::new(port_start, port_count))
    }

    /// Drops the hub's client and starts a new init if it can be reached.
    fn reinit(&mut self, name: &str) {
        self.generations += 1;
        let generation = self.generations;
        let Some(hub) = self.hubs.get_mut(name) else {
            return;
        };
        hub.reset(generation);

        if let (Some(_), Some(kubeconfig)) = (&hub.spec, &hub.kubeconfig) {
            tracing::info!(hub = %name, generation, "Initializing hub");
            let init = Init {
                hub: name.to_string(),
                generation,
                kubeconfig: kubeconfig.clone(),
            };
            if self.inits.send(init).is_err() {
                tracing::error!(hub = %name, "Hub initializer has stopped");
            }
        }
    }

    fn config_maps(&self, hub: &str) -> Result<k8s::Api<ConfigMap>> {
        let client = self
            .hubs
            .get(hub)
            .and_then(|h| h.client.clone())
            .with_context(|| format!("hub {hub} is not ready"))?;
        Ok(k8s::Api::namespaced(
            client,
            &self.cluster_info.tunnel_namespace,
        ))
    }

    #[cfg(test)]
    pub(crate) fn generation(&self, hub: &str) -> u64 {
        self.hubs.get(hub).map(|h| h.generation).unwrap_or_default()
    }

    fn is_current(&self, hub: &str, generation: u64) -> bool {
        self.hubs
            .get(hub)
            .is_some_and(|h| h.generation == generation && h.spec.is_some())
    }

    /// Installs the result of a successful init.
    fn install(
        &mut self,
        name: &str,
        client: k8s::Client,
        peers: ports::Peers,
        informer: JoinHandle<()>,
    ) {
        let allocator = self.allocator(name);
        for (peer, port) in peers {
            if let Err(error) = allocator.register(peer, port) {
                tracing::warn!(hub = %name, %error, "Ignoring recovered port");
            }
        }

        if let Some(hub) = self.hubs.get_mut(name) {
            hub.client = Some(client);
            hub.informer = Some(informer);
        }
        tracing::info!(hub = %name, "Hub ready");
        self.notify();
    }

    /// Applies a Service event from a hub's informer. Returns false once the
    /// informer is stale.
    pub(crate) fn service_event(
        &mut self,
        name: &str,
        generation: u64,
        event: watcher::Event<Service>,
    ) -> bool {
        let Some(hub) = self.hubs.get_mut(name).filter(|h| h.generation == generation) else {
            return false;
        };

        match event {
            watcher::Event::Init => {
                hub.relisting = Some(HashMap::default());
                return true;
            }
            watcher::Event::InitApply(svc) => {
                if let Some(relisting) = hub.relisting.as_mut() {
                    relisting.insert(service_id(&svc), svc);
                }
                return true;
            }
            watcher::Event::InitDone => {
                hub.services = hub.relisting.take().unwrap_or_default();
            }
            watcher::Event::Apply(svc) => {
                hub.services.insert(service_id(&svc), svc);
            }
            watcher::Event::Delete(svc) => {
                hub.services.remove(&service_id(&svc));
            }
        }

        self.notify_services(name);
        true
    }
}

impl kubert::index::IndexNamespacedResource<Hub> for Registry {
    fn apply(&mut self, hub: Hub) {
        let name = hub.name_unchecked();
        let state = self.hubs.entry(name.clone()).or_default();
        let spec = Some(hub.spec);
        if state.spec == spec {
            return;
        }

        let added = state.spec.is_none();
        state.spec = spec;
        tracing::debug!(hub = %name, added, "Hub updated");
        if added {
            self.reinit(&name);
        }
        self.notify();
    }

    fn delete(&mut self, _ns: String, name: String) {
        let Some(mut state) = self.hubs.remove(&name) else {
            return;
        };
        tracing::info!(hub = %name, "Hub removed");

        // Credentials may outlive the hub.
        if state.kubeconfig.is_some() || state.authorized.is_some() {
            let credentials = self.hubs.entry(name.clone()).or_default();
            credentials.kubeconfig = state.kubeconfig.take();
            credentials.authorized = state.authorized.take();
        }
        drop(state);

        self.notify_services(&name);
        self.notify();
    }
}

impl kubert::index::IndexNamespacedResource<Secret> for Registry {
    fn apply(&mut self, secret: Secret) {
        let name = secret.name_unchecked();
        let data = secret.data.unwrap_or_default();
        let read = |key: &str| {
            data.get(key)
                .and_then(|v| String::from_utf8(v.0.clone()).ok())
                .filter(|v| !v.is_empty())
        };
        let Some(kubeconfig) = read(KUBECONFIG_KEY) else {
            return;
        };
        let authorized = read(AUTHORIZED_KEY).map(|k| k.trim().to_string());

        let state = self.hubs.entry(name.clone()).or_default();
        if state.kubeconfig.as_ref() == Some(&kubeconfig) {
            if state.authorized != authorized {
                state.authorized = authorized;
                self.notify();
            }
            return;
        }
        state.authorized = authorized;
        state.kubeconfig = Some(kubeconfig);
        tracing::debug!(hub = %name, "Hub credentials updated");
        self.reinit(&name);
        self.notify();
    }

    fn delete(&mut self, _ns: String, name: String) {
        let Some(state) = self.hubs.get_mut(&name) else {
            return;
        };
        tracing::info!(hub = %name, "Hub credentials removed");
        state.kubeconfig = None;
        state.authorized = None;
        self.reinit(&name);
        self.notify_services(&name);
        self.notify();
    }
}

#[async_trait::async_trait]
impl Hubs for RwLock<Registry> {
    fn hub_ready(&self, hub: &str) -> bool {
        self.read()
            .hubs
            .get(hub)
            .is_some_and(|h| h.spec.is_some() && h.client.is_some())
    }

    fn gateway(&self, hub: &str, for_hub: &str) -> Gateway {
        self.read()
            .hubs
            .get(hub)
            .and_then(|h| h.spec.as_ref())
            .map(|spec| gateway::from_spec(spec.gateway_for(for_hub)))
            .unwrap_or_default()
    }

    fn authorized(&self, hub: &str) -> Option<String> {
        self.read().hubs.get(hub)?.authorized.clone()
    }

    fn get_service(&self, hub: &str, namespace: &str, name: &str) -> Option<Service> {
        let id = (namespace.to_string(), name.to_string());
        self.read().hubs.get(hub)?.services.get(&id).cloned()
    }

    fn get_port_peer(&self, import: &str, peer: &PortPeer) -> Result<u16, PortError> {
        self.write().allocator(import).get(peer)
    }

    fn load_port_peer(&self, import: &str, peers: ports::Peers) -> Result<(), PortError> {
        self.write().allocator(import).load(peers)
    }

    fn delete_port_peer(&self, import: &str, peer: &PortPeer) -> Option<u16> {
        self.write().allocators.get_mut(import)?.delete(peer)
    }

    fn register_service_callback(&self, export: &str, import: &str, trigger: Trigger) {
        self.write()
            .callbacks
            .insert((export.to_string(), import.to_string()), trigger);
    }

    fn unregister_service_callback(&self, export: &str, import: &str) {
        self.write()
            .callbacks
            .remove(&(export.to_string(), import.to_string()));
    }

    async fn list_config_maps(&self, hub: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        let api = self.read().config_maps(hub)?;
        let list = api
            .list(&k8s::ListParams::default().labels(selector))
            .await
            .map_err(|error| api_error(self, hub, error))
            .with_context(|| format!("listing ConfigMaps on hub {hub}"))?;
        Ok(list.items)
    }

    async fn apply_config_map(&self, hub: &str, cm: &ConfigMap) -> Result<()> {
        let api = self.read().config_maps(hub)?;
        let name = cm.name_any();
        let params = k8s::PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &k8s::Patch::Apply(cm))
            .await
            .map_err(|error| api_error(self, hub, error))
            .with_context(|| format!("applying ConfigMap {name} on hub {hub}"))?;
        Ok(())
    }

    async fn delete_config_map(&self, hub: &str, name: &str) -> Result<()> {
        let api = self.read().config_maps(hub)?;
        match api.delete(name, &k8s::DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(k8s::Error::Api(k8s::ErrorResponse { code: 404, .. })) => Ok(()),
            Err(error) => Err(api_error(self, hub, error))
                .with_context(|| format!("deleting ConfigMap {name} on hub {hub}")),
        }
    }
}

/// Rebuilds the client of a hub that rejects its credentials.
fn api_error(registry: &RwLock<Registry>, hub: &str, error: k8s::Error) -> k8s::Error {
    if let k8s::Error::Api(k8s::ErrorResponse { code: 401, .. }) = &error {
        let mut registry = registry.write();
        if registry.hubs.get(hub).is_some_and(|h| h.client.is_some()) {
            tracing::warn!(%hub, "Hub rejected its credentials");
            registry.reinit(hub);
            registry.notify();
        }
    }
    error
}

fn service_id(svc: &Service) -> ServiceId {
    (svc.namespace().unwrap_or_default(), svc.name_unchecked())
}

// === impl HubState ===

impl HubState {
    fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.client = None;
        self.services.clear();
        self.relisting = None;
        if let Some(informer) = self.informer.take() {
            informer.abort();
        }
    }
}

impl Drop for HubState {
    fn drop(&mut self) {
        if let Some(informer) = self.informer.take() {
            informer.abort();
        }
    }
}

// === impl Initializer ===

impl Initializer {
    const BACKOFF: time::Duration = time::Duration::from_secs(5);

    pub fn new(
        registry: SharedRegistry,
        tx: UnboundedSender<Init>,
        rx: UnboundedReceiver<Init>,
    ) -> Self {
        Self {
            registry,
            tx,
            rx,
            backoff: Self::BACKOFF,
        }
    }

    pub async fn run(mut self) {
        while let Some(init) = self.rx.recv().await {
            let span = info_span!("hub", hub = %init.hub, generation = init.generation);
            tokio::spawn(
                init_hub(self.registry.clone(), self.tx.clone(), init, self.backoff)
                    .instrument(span),
            );
        }
    }
}

async fn init_hub(
    registry: SharedRegistry,
    retries: UnboundedSender<Init>,
    init: Init,
    backoff: time::Duration,
) {
    let tunnel_namespace = {
        let registry = registry.read();
        if !registry.is_current(&init.hub, init.generation) {
            return;
        }
        registry.cluster_info.tunnel_namespace.clone()
    };

    let (client, peers) = match connect(&init.kubeconfig, &tunnel_namespace).await {
        Ok(connected) => connected,
        Err(error) => {
            tracing::warn!(%error, "Failed to initialize hub");
            time::sleep(backoff).await;
            if registry.read().is_current(&init.hub, init.generation) {
                let _ = retries.send(init);
            }
            return;
        }
    };

    let mut write = registry.write();
    if !write.is_current(&init.hub, init.generation) {
        tracing::debug!("Discarding stale hub client");
        return;
    }
    let informer = tokio::spawn(
        watch_services(
            registry.clone(),
            init.hub.clone(),
            init.generation,
            client.clone(),
        )
        .instrument(info_span!("services")),
    );
    write.install(&init.hub, client, peers, informer);
}

/// Builds a hub's client and reads the port assignments of its tunnel
/// Services.
async fn connect(kubeconfig: &str, tunnel_namespace: &str) -> Result<(k8s::Client, ports::Peers)> {
    let kubeconfig = kube::config::Kubeconfig::from_yaml(kubeconfig).context("parsing kubeconfig")?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
        .await
        .context("loading kubeconfig")?;
    let client = k8s::Client::try_from(config).context("building client")?;

    k8s::Api::<k8s::Namespace>::all(client.clone())
        .get(tunnel_namespace)
        .await
        .with_context(|| format!("fetching namespace {tunnel_namespace}"))?;

    let services = k8s::Api::<Service>::namespaced(client.clone(), tunnel_namespace)
        .list(&k8s::ListParams::default().labels(labels::EXPORTED_FROM))
        .await
        .context("listing tunnel services")?;

    let mut peers = Vec::new();
    for svc in &services.items {
        match ports::from_service(svc) {
            Ok(recovered) => peers.extend(recovered),
            Err(error) => {
                tracing::warn!(service = %svc.name_any(), %error, "Invalid tunnel service labels")
            }
        }
    }

    // Assignments published by earlier runs whose Services were not created yet.
    let selector = format!("{}={}", labels::TUNNEL_CONFIG, labels::Config::Service);
    let config_maps = k8s::Api::<k8s::ConfigMap>::namespaced(client.clone(), tunnel_namespace)
        .list(&k8s::ListParams::default().labels(&selector))
        .await
        .context("listing service config maps")?;
    for cm in &config_maps.items {
        match ports::from_config_map(cm) {
            Ok(recovered) => peers.extend(recovered),
            Err(error) => {
                tracing::warn!(configmap = %cm.name_any(), %error, "Invalid service config map")
            }
        }
    }

    Ok((client, peers))
}

async fn watch_services(registry: SharedRegistry, hub: String, generation: u64, client: k8s::Client) {
    let events = kube::runtime::watcher(
        k8s::Api::<Service>::all(client),
        watcher::Config::default(),
    )
    .default_backoff();
    futures::pin_mut!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if !registry.write().service_event(&hub, generation, event) {
                    break;
                }
            }
            Err(error) => tracing::info!(%error, "Service watch failed"),
        }
    }
    tracing::debug!("Service informer stopped");
}
