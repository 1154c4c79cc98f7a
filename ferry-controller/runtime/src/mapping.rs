//! Reconciles the tunnel resources of one `(export, import)` hub pair.
//!
//! Each pair runs in its own task. The task owns the resources it last
//! applied to every hub on the way and, on each debounced sync, renders the
//! resources its routes need, applies what changed and deletes what is no
//! longer rendered. Closing the handle deletes everything the pair owns.

use crate::{
    core::{chain, way, ChainError, PortError, PortPeer, ServiceRef, Tunnel},
    index::{debounce, ports, Hubs},
    k8s::{
        labels::{self, Config as ConfigKind, Labels},
        tunnel, ResourceExt, Route, Service,
    },
    metrics::{MappingMetrics, PairMetrics},
    render::{self, RenderError, Resources},
    status::{self, ConditionType, Report, ResourceId, RouteCondition},
};
use ahash::AHashSet as HashSet;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle, time::Duration};
use tracing::{info_span, Instrument};

/// Shown as the path of routes whose hubs are directly connected.
const DIRECT: &str = "<Direct>";

#[derive(Clone, Debug)]
pub struct Config {
    /// The key every SSH hop authenticates with.
    pub identity_file: String,
    pub debounce: Duration,
}

/// Handle to a running mapping controller.
pub struct Mapping<H> {
    export: String,
    import: String,
    hubs: Arc<H>,
    routes: watch::Sender<Vec<Route>>,
    trigger: debounce::Trigger,
    task: JoinHandle<()>,
}

struct Controller<H> {
    export: String,
    import: String,
    hubs: Arc<H>,
    status: status::SharedIndex,
    config: Arc<Config>,
    routes: watch::Receiver<Vec<Route>>,

    /// What was last applied, keyed by hub.
    cache: Resources,

    /// Hubs whose existing resources were read into `cache`.
    seeded: HashSet<String>,
    metrics: PairMetrics,
}

#[derive(Debug, thiserror::Error)]
enum RouteError {
    #[error("service {namespace}/{name} not found on hub {hub}")]
    ServiceNotFound {
        hub: String,
        namespace: String,
        name: String,
    },

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

// === impl Mapping ===

impl<H: Hubs> Mapping<H> {
    /// Starts the controller of a pair.
    ///
    /// When a previous controller of the same pair is still tearing down,
    /// `previous` is awaited before anything is read from the hubs.
    pub fn spawn(
        export: &str,
        import: &str,
        hubs: Arc<H>,
        status: status::SharedIndex,
        config: Arc<Config>,
        metrics: &MappingMetrics,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        let (trigger, debounced) = debounce::channel();
        let (routes_tx, routes_rx) = watch::channel(Vec::new());
        hubs.register_service_callback(export, import, trigger.clone());

        let controller = Controller {
            export: export.to_string(),
            import: import.to_string(),
            hubs: hubs.clone(),
            status,
            config,
            routes: routes_rx,
            cache: Resources::default(),
            seeded: HashSet::new(),
            metrics: metrics.pair(export, import),
        };
        let task = tokio::spawn(
            async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                controller.run(debounced).await
            }
            .instrument(info_span!("mapping", %export, %import)),
        );

        Self {
            export: export.to_string(),
            import: import.to_string(),
            hubs,
            routes: routes_tx,
            trigger,
            task,
        }
    }

    pub fn set_routes(&self, routes: Vec<Route>) {
        self.routes.send_replace(routes);
    }

    /// Requests a sync. Bursts of requests are coalesced.
    pub fn sync(&self) {
        self.trigger.trigger();
    }

    /// Stops the controller. The returned task completes once every resource
    /// the pair owns has been deleted.
    pub fn close(self) -> JoinHandle<()> {
        let Self {
            export,
            import,
            hubs,
            routes,
            trigger,
            task,
        } = self;
        hubs.unregister_service_callback(&export, &import);
        drop(routes);
        trigger.trigger();
        task
    }
}

// === impl Controller ===

impl<H: Hubs> Controller<H> {
    async fn run(mut self, mut debounced: debounce::Debounced) {
        while !self.is_closed() && debounced.next(self.config.debounce).await {
            if self.is_closed() {
                break;
            }
            self.sync().await;
        }
        self.teardown().await;
    }

    /// The handle drops its route sender when it is closed.
    fn is_closed(&self) -> bool {
        self.routes.has_changed().is_err()
    }

    async fn sync(&mut self) {
        self.metrics.sync();
        let routes = self.routes.borrow_and_update().clone();
        let routes = routes
            .into_iter()
            .filter_map(|route| {
                let id = ResourceId::new(route.namespace()?, route.name_unchecked());
                Some((id, route))
            })
            .collect::<Vec<_>>();

        let export_ready = self.hubs.hub_ready(&self.export);
        let import_ready = self.hubs.hub_ready(&self.import);
        let readiness = Report::default()
            .condition(hub_condition(
                ConditionType::ExportHubReady,
                &self.export,
                export_ready,
            ))
            .condition(hub_condition(
                ConditionType::ImportHubReady,
                &self.import,
                import_ready,
            ));
        if !(export_ready && import_ready) {
            tracing::debug!(export_ready, import_ready, "Waiting for hubs");
            for (id, _) in &routes {
                self.report(id, readiness.clone());
            }
            self.metrics.sync_error();
            return;
        }

        let way = way::solve(&self.export, &self.import, |hub, for_hub| {
            self.hubs.gateway(hub, for_hub)
        });
        tracing::debug!(?way, "Solved way");
        self.seed(&way).await;

        let mut next = Resources::default();
        let mut rendered = Vec::with_capacity(routes.len());
        let mut frozen = false;
        for (id, route) in &routes {
            let report = readiness.clone().way(way.clone());
            match self.render_route(route, &way) {
                Ok(resources) => {
                    next.merge(resources);
                    rendered.push((id, report));
                }
                Err(error) => frozen |= self.report_error(id, report, error, &way),
            }
        }

        if frozen {
            // Keep whatever was applied before until every chain builds again.
            self.metrics.sync_error();
            return;
        }

        let failed = self.converge(&next).await;
        if failed {
            self.metrics.sync_error();
        }

        for (id, report) in rendered {
            let synced = if failed {
                RouteCondition::not_ready(
                    ConditionType::RouteSynced,
                    "ApplyFailed",
                    "failed to apply tunnel resources",
                )
            } else {
                RouteCondition::ready(
                    ConditionType::RouteSynced,
                    "Synced",
                    "tunnel resources applied",
                )
            };
            let report = report
                .condition(RouteCondition::ready(
                    ConditionType::PortsAllocated,
                    "Allocated",
                    format!("bind ports allocated on hub {}", self.import),
                ))
                .condition(path_condition(&way))
                .condition(synced);
            self.report(id, report);
        }
    }

    /// Reports why a route could not be rendered. Returns true when nothing
    /// may be applied or deleted on this sync.
    ///
    /// Malformed chains are only logged: they are not a property of the route.
    fn report_error(
        &self,
        id: &ResourceId,
        report: Report,
        error: RouteError,
        way: &[String],
    ) -> bool {
        let (report, frozen) = match error {
            error @ RouteError::ServiceNotFound { .. } => {
                // Whatever the route published before is deleted by the sync.
                let report = report.condition(path_condition(way)).condition(
                    RouteCondition::not_ready(ConditionType::RouteSynced, "ServiceNotFound", error),
                );
                (report, false)
            }
            RouteError::Ports(error) => {
                tracing::warn!(route = %id, %error, "Failed to allocate ports");
                let report = report.condition(RouteCondition::not_ready(
                    ConditionType::PortsAllocated,
                    "AllocationFailed",
                    error,
                ));
                (report, false)
            }
            RouteError::Chain(error @ ChainError::Unreachable { .. }) => {
                let report = report.condition(RouteCondition::not_ready(
                    ConditionType::PathReachable,
                    "Unreachable",
                    error,
                ));
                (report, true)
            }
            RouteError::Chain(error) => {
                tracing::error!(route = %id, %error, "Failed to build tunnel chain");
                return true;
            }
            RouteError::Render(error) => {
                tracing::error!(route = %id, %error, "Failed to render tunnel");
                let report = report.condition(RouteCondition::not_ready(
                    ConditionType::RouteSynced,
                    "RenderFailed",
                    error,
                ));
                (report, false)
            }
        };
        self.report(id, report);
        frozen
    }

    /// Renders everything a single route needs on every hub of the way.
    fn render_route(&self, route: &Route, way: &[String]) -> Result<Resources, RouteError> {
        let spec = &route.spec;
        let service = ServiceRef::new(
            &spec.export.service.namespace,
            &spec.export.service.name,
        );
        let svc = self
            .hubs
            .get_service(&self.export, &service.namespace, &service.name)
            .ok_or_else(|| RouteError::ServiceNotFound {
                hub: self.export.clone(),
                namespace: service.namespace.clone(),
                name: service.name.clone(),
            })?;

        let name = route.name_unchecked();
        let pair = Labels::pair(&self.export, &self.import);
        let mut resources = Resources::default();
        let mut published = Vec::new();
        for (protocol, port) in service_ports(&svc) {
            let peer = PortPeer::new(&self.export, &service.namespace, &service.name, port);
            let bind_port = self.hubs.get_port_peer(&self.import, &peer)?;
            let tunnel = Tunnel {
                route: &name,
                service: &service,
                export_port: port,
                bind_port,
                identity_file: &self.config.identity_file,
            };
            let bounds = chain::build(way, &tunnel, |hub, for_hub| {
                self.hubs.gateway(hub, for_hub)
            })?;
            render::bound(&mut resources, &pair, &tunnel, &bounds, |peer| {
                self.hubs.authorized(peer)
            })?;
            published.push(tunnel::ServicePort {
                name: format!("{}-{port}", protocol.to_lowercase()),
                protocol,
                port,
                target_port: bind_port,
            });
        }

        if !published.is_empty() {
            resources.insert(
                &self.import,
                render::service(&pair, &name, spec, &published)?,
            );
        }
        Ok(resources)
    }

    /// Applies what changed and deletes what is no longer rendered. Returns
    /// true if any API call failed.
    ///
    /// Failed applies leave the cache untouched and failed deletes keep their
    /// entry, so the next sync retries both.
    async fn converge(&mut self, next: &Resources) -> bool {
        let mut failed = false;

        let apply = self
            .cache
            .to_apply(next)
            .into_iter()
            .map(|(hub, cm)| (hub.to_string(), cm.clone()))
            .collect::<Vec<_>>();
        for (hub, cm) in apply {
            match self.hubs.apply_config_map(&hub, &cm).await {
                Ok(()) => {
                    tracing::info!(%hub, name = %cm.name_any(), "Applied");
                    self.metrics.applied(&hub);
                    self.cache.insert(&hub, cm);
                }
                Err(error) => {
                    tracing::warn!(%hub, name = %cm.name_any(), %error, "Failed to apply ConfigMap");
                    self.metrics.api_error(&hub);
                    failed = true;
                }
            }
        }

        for (hub, name) in self.cache.to_delete(next) {
            if !self.delete(&hub, &name).await {
                failed = true;
            }
        }

        failed
    }

    /// Reads the resources a previous run left on the hubs of `way`, and
    /// recovers port assignments from their `service` ConfigMaps.
    async fn seed(&mut self, way: &[String]) {
        let selector = Labels::pair(&self.export, &self.import).selector();
        for hub in way {
            if self.seeded.contains(hub) || !self.hubs.hub_ready(hub) {
                continue;
            }
            let cms = match self.hubs.list_config_maps(hub, &selector).await {
                Ok(cms) => cms,
                Err(error) => {
                    tracing::warn!(%hub, %error, "Failed to list ConfigMaps");
                    self.metrics.api_error(hub);
                    continue;
                }
            };

            for cm in cms {
                if *hub == self.import && labels::config_of(cm.labels()) == Some(ConfigKind::Service)
                {
                    let loaded = ports::from_config_map(&cm)
                        .and_then(|peers| self.hubs.load_port_peer(hub, peers));
                    if let Err(error) = loaded {
                        tracing::warn!(%hub, name = %cm.name_any(), %error, "Failed to recover ports");
                    }
                }
                self.cache.insert(hub, render::normalize(cm));
            }
            self.seeded.insert(hub.clone());
        }
    }

    /// Deletes every resource the pair owns.
    async fn teardown(&mut self) {
        let way = way::solve(&self.export, &self.import, |hub, for_hub| {
            self.hubs.gateway(hub, for_hub)
        });
        self.seed(&way).await;

        let mut remaining = 0;
        for (hub, name) in self.cache.to_delete(&Resources::default()) {
            if !self.delete(&hub, &name).await {
                remaining += 1;
            }
        }
        if remaining > 0 {
            tracing::warn!(remaining, "Closed with resources left behind");
        } else {
            tracing::debug!("Closed");
        }
    }

    /// Returns false if the ConfigMap could not be deleted.
    async fn delete(&mut self, hub: &str, name: &str) -> bool {
        match self.hubs.delete_config_map(hub, name).await {
            Ok(()) => {
                tracing::info!(%hub, %name, "Deleted");
                self.metrics.deleted(hub);
                self.cache.remove(hub, name);
                true
            }
            Err(error) => {
                tracing::warn!(%hub, %name, %error, "Failed to delete ConfigMap");
                self.metrics.api_error(hub);
                false
            }
        }
    }

    fn report(&self, id: &ResourceId, report: Report) {
        self.status.write().report(id, report);
    }
}

fn hub_condition(type_: ConditionType, hub: &str, ready: bool) -> RouteCondition {
    if ready {
        RouteCondition::ready(type_, "Ready", format!("hub {hub} is ready"))
    } else {
        RouteCondition::not_ready(type_, "HubNotReady", format!("hub {hub} is not ready"))
    }
}

fn path_condition(way: &[String]) -> RouteCondition {
    let middle = way
        .get(1..way.len().saturating_sub(1))
        .filter(|m| !m.is_empty())
        .map(|m| m.join(","))
        .unwrap_or_else(|| DIRECT.to_string());
    RouteCondition::ready(ConditionType::PathReachable, "Reachable", middle)
}

/// The `(protocol, port)` of every valid port of a Service.
fn service_ports(svc: &Service) -> Vec<(String, u16)> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default()
        .iter()
        .filter_map(|p| match u16::try_from(p.port) {
            Ok(port) if port != 0 => Some((
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                port,
            )),
            _ => {
                tracing::warn!(service = %svc.name_any(), port = p.port, "Ignoring invalid port");
                None
            }
        })
        .collect()
}
