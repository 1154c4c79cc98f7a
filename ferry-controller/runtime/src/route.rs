//! Groups routes by hub pair and drives one mapping controller per pair.

use crate::{
    core::PortPeer,
    index::{debounce, Hubs},
    k8s::{ResourceExt, Route},
    mapping::{self, Mapping},
    metrics::MappingMetrics,
    status::{self, ConditionType, Report, ResourceId, RouteCondition},
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    task::JoinHandle,
    time::{self, Duration},
};

/// An `(export, import)` hub pair.
type Pair = (String, String);

pub type SharedIndex<H> = Arc<RwLock<Index<H>>>;

/// Holds the latest spec of every route and the bind ports allocated for
/// them.
pub struct Index<H> {
    hubs: Arc<H>,
    status: status::SharedIndex,
    routes: BTreeMap<ResourceId, Route>,

    /// The import hub and port peers allocated for each route.
    allocated: HashMap<ResourceId, (String, Vec<PortPeer>)>,

    /// Requests a regrouping.
    changed: debounce::Trigger,
}

/// Starts, updates and closes mapping controllers as routes change.
pub struct Controller<H> {
    index: SharedIndex<H>,
    hubs: Arc<H>,
    status: status::SharedIndex,
    config: Arc<mapping::Config>,
    metrics: MappingMetrics,
    mappings: HashMap<Pair, Mapping<H>>,

    /// Teardown tasks of closed mappings, awaited by their successors.
    closing: HashMap<Pair, JoinHandle<()>>,
}

// === impl Index ===

impl<H: Hubs> Index<H> {
    pub fn shared(
        hubs: Arc<H>,
        status: status::SharedIndex,
        changed: debounce::Trigger,
    ) -> SharedIndex<H> {
        Arc::new(RwLock::new(Self {
            hubs,
            status,
            routes: BTreeMap::new(),
            allocated: HashMap::new(),
            changed,
        }))
    }

    /// Valid routes grouped by hub pair.
    fn groups(&self) -> BTreeMap<Pair, Vec<Route>> {
        let mut groups = BTreeMap::<Pair, Vec<Route>>::new();
        for route in self.routes.values() {
            let pair = (
                route.spec.export.hub_name.clone(),
                route.spec.import.hub_name.clone(),
            );
            groups.entry(pair).or_default().push(route.clone());
        }
        groups
    }

    /// Allocates the bind port of every exported port of a route on its
    /// import hub.
    ///
    /// Nothing is allocated before the import hub is ready, since its
    /// existing assignments are only known once it is.
    fn allocate(&mut self, id: &ResourceId) {
        let Some(route) = self.routes.get(id) else {
            return;
        };
        let import = route.spec.import.hub_name.clone();
        if !self.hubs.hub_ready(&import) {
            return;
        }
        let Some(wanted) = service_peers(&*self.hubs, route) else {
            return;
        };

        let mut peers = Vec::new();
        let mut error = None;
        for peer in wanted {
            match self.hubs.get_port_peer(&import, &peer) {
                Ok(bind_port) => {
                    tracing::debug!(route = %id, port = peer.port, bind_port, "Allocated port");
                    peers.push(peer);
                }
                Err(e) => {
                    tracing::warn!(
                        route = %id,
                        port = peer.port,
                        error = %e,
                        "Failed to allocate port"
                    );
                    error = Some(e);
                }
            }
        }

        let condition = match error {
            None => RouteCondition::ready(
                ConditionType::PortsAllocated,
                "Allocated",
                format!("bind ports allocated on hub {import}"),
            ),
            Some(error) => {
                RouteCondition::not_ready(ConditionType::PortsAllocated, "AllocationFailed", error)
            }
        };
        self.status
            .write()
            .report(id, Report::default().condition(condition));

        if let Some((old_import, old_peers)) = self.allocated.insert(id.clone(), (import, peers)) {
            self.release(&old_import, old_peers);
        }
    }

    /// Frees the ports of `peers` that no remaining route uses.
    fn release(&mut self, import: &str, peers: Vec<PortPeer>) {
        for peer in peers {
            let in_use = self
                .allocated
                .values()
                .any(|(i, p)| i == import && p.contains(&peer));
            if in_use {
                continue;
            }
            if let Some(port) = self.hubs.delete_port_peer(import, &peer) {
                tracing::debug!(%import, ?peer, port, "Released port");
            }
        }
    }

    /// Re-runs the allocation of every route.
    ///
    /// Mapping controllers allocate the ports a Service gains after its routes
    /// were allocated; this records them against the routes that use them.
    fn allocate_all(&mut self) {
        let ids = self.routes.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            self.allocate(&id);
        }
    }

    /// Frees the ports of a route that was removed or changed: those recorded
    /// for it and those of every port its Service has now.
    fn release_route(&mut self, route: &Route, recorded: Option<(String, Vec<PortPeer>)>) {
        if let Some((import, peers)) = recorded {
            self.release(&import, peers);
        }
        if let Some(peers) = service_peers(&*self.hubs, route) {
            self.release(&route.spec.import.hub_name, peers);
        }
    }

    fn remove(&mut self, id: &ResourceId) {
        let recorded = self.allocated.remove(id);
        let Some(route) = self.routes.remove(id) else {
            if let Some((import, peers)) = recorded {
                self.release(&import, peers);
            }
            return;
        };
        self.allocate_all();
        self.release_route(&route, recorded);
        self.changed.trigger();
    }
}

impl<H: Hubs> kubert::index::IndexNamespacedResource<Route> for Index<H> {
    fn apply(&mut self, route: Route) {
        let Some(namespace) = route.namespace() else {
            return;
        };
        let id = ResourceId::new(namespace, route.name_unchecked());

        if !route.spec.is_valid() {
            tracing::warn!(route = %id, "Ignoring route that does not join two distinct hubs");
            self.remove(&id);
            return;
        }
        if self.routes.get(&id).map(|r| &r.spec) == Some(&route.spec) {
            return;
        }

        let recorded = self.allocated.remove(&id);
        let previous = self.routes.insert(id.clone(), route);
        self.allocate_all();
        if let Some(previous) = previous {
            self.release_route(&previous, recorded);
        }
        self.changed.trigger();
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove(&ResourceId::new(namespace, name));
    }
}

// === impl Controller ===

impl<H: Hubs> Controller<H> {
    pub fn new(
        index: SharedIndex<H>,
        hubs: Arc<H>,
        status: status::SharedIndex,
        config: Arc<mapping::Config>,
        metrics: MappingMetrics,
    ) -> Self {
        Self {
            index,
            hubs,
            status,
            config,
            metrics,
            mappings: HashMap::new(),
            closing: HashMap::new(),
        }
    }

    /// Regroups routes after every burst of changes until every trigger is
    /// dropped.
    pub async fn run(mut self, mut changes: debounce::Debounced) {
        while changes.next(self.config.debounce).await {
            self.reconcile();
        }
        tracing::debug!("Route controller stopped");
    }

    /// Closes mappings whose routes are gone and hands every other pair its
    /// current routes.
    fn reconcile(&mut self) {
        self.closing.retain(|_, task| !task.is_finished());

        let groups = {
            let mut index = self.index.write();
            index.allocate_all();
            index.groups()
        };

        let stale = self
            .mappings
            .keys()
            .filter(|pair| !groups.contains_key(*pair))
            .cloned()
            .collect::<Vec<_>>();
        for pair in stale {
            if let Some(mapping) = self.mappings.remove(&pair) {
                tracing::info!(export = %pair.0, import = %pair.1, "Closing mapping");
                self.closing.insert(pair, mapping.close());
            }
        }

        for (pair, routes) in groups {
            let mapping = self.mappings.entry(pair).or_insert_with_key(|pair| {
                tracing::info!(export = %pair.0, import = %pair.1, "Starting mapping");
                Mapping::spawn(
                    &pair.0,
                    &pair.1,
                    self.hubs.clone(),
                    self.status.clone(),
                    self.config.clone(),
                    &self.metrics,
                    self.closing.remove(pair),
                )
            });
            mapping.set_routes(routes);
            mapping.sync();
        }
    }
}

/// The port peers of every valid port the exported Service of a route has, or
/// `None` if the Service is not known.
fn service_peers<H: Hubs>(hubs: &H, route: &Route) -> Option<Vec<PortPeer>> {
    let export = &route.spec.export;
    let svc = hubs.get_service(
        &export.hub_name,
        &export.service.namespace,
        &export.service.name,
    )?;
    let ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();
    let peers = ports
        .iter()
        .filter_map(|p| u16::try_from(p.port).ok().filter(|port| *port != 0))
        .map(|port| {
            PortPeer::new(
                &export.hub_name,
                &export.service.namespace,
                &export.service.name,
                port,
            )
        })
        .collect();
    Some(peers)
}

/// Requests a regrouping every `interval`, so that every mapping is
/// resynchronized even when nothing is observed to change.
pub async fn resync(changed: debounce::Trigger, interval: Duration) {
    let mut interval = time::interval(interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        changed.trigger();
    }
}
