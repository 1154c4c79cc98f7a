use crate::{
    conditions::{
        ConditionType, RouteCondition, PHASE_NOT_READY, PHASE_READY, REASON_READY, ROUTE_READY,
    },
    resource_id::ResourceId,
};
use ahash::AHashMap as HashMap;
#[cfg(not(test))]
use chrono::offset::Utc;
use ferry_controller_k8s_api::{
    self as k8s,
    traffic::{API_VERSION, ROUTE_KIND},
    Condition, ResourceExt, Route, RouteStatus, Time,
};
use parking_lot::RwLock;
use prometheus_client::{
    metrics::{counter::Counter, histogram::Histogram},
    registry::Registry,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{self, Duration, Instant},
};

/// The field manager used when patching route statuses.
pub const STATUS_CONTROLLER_NAME: &str = "ferry-controller";

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the status of every known route and publishes a patch whenever a
/// rendered status differs from the last one sent.
pub struct Index {
    updates: mpsc::Sender<Update>,
    routes: HashMap<ResourceId, RouteState>,
    metrics: IndexMetrics,
}

/// A batch of status changes for one route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    way: Option<Vec<String>>,
    conditions: Vec<RouteCondition>,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub patch: k8s::Patch<serde_json::Value>,
}

pub struct Controller {
    client: k8s::Client,
    index: SharedIndex,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    patches_enqueued: Counter,
    patches_dropped: Counter,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
    patch_duration: Histogram,
}

#[derive(Debug, Default)]
struct RouteState {
    export: String,
    import: String,
    way: String,
    conditions: BTreeMap<ConditionType, Condition>,
    last_synchronization: Option<Time>,
    /// The last status handed to the controller, cleared if it could not
    /// be written.
    patched: Option<RouteStatus>,
}

// === impl Index ===

impl Index {
    pub fn shared(updates: mpsc::Sender<Update>, metrics: IndexMetrics) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            updates,
            routes: HashMap::new(),
            metrics,
        }))
    }

    /// Records `report` against a known route. Reports for routes that are
    /// not (or no longer) indexed are discarded.
    pub fn report(&mut self, id: &ResourceId, report: Report) {
        let Some(state) = self.routes.get_mut(id) else {
            tracing::debug!(%id, "Ignoring status of unknown route");
            return;
        };

        let now = now();
        if let Some(way) = report.way {
            state.way = way.join(",");
        }
        for condition in &report.conditions {
            state.set(condition, &now);
        }
        self.publish(id);
    }

    /// Forgets the status last handed to the controller for a route, so the
    /// next report publishes it again even if nothing changed.
    pub fn patch_failed(&mut self, id: &ResourceId) {
        if let Some(state) = self.routes.get_mut(id) {
            state.patched = None;
        }
    }

    /// Renders the current status of a route.
    pub fn status(&self, id: &ResourceId) -> Option<RouteStatus> {
        self.routes.get(id).map(RouteState::render)
    }

    fn publish(&mut self, id: &ResourceId) {
        let Some(state) = self.routes.get_mut(id) else {
            return;
        };
        let status = state.render();
        if state.patched.as_ref() == Some(&status) {
            return;
        }

        let patch = make_patch(&id.name, &status);
        match self.updates.try_send(Update {
            id: id.clone(),
            patch,
        }) {
            Ok(()) => {
                self.metrics.patches_enqueued.inc();
                state.patched = Some(status);
            }
            Err(TrySendError::Full(_)) => {
                // The status is published again by the next report.
                self.metrics.patches_dropped.inc();
                tracing::warn!(%id, "Status update queue is full");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(%id, "Status controller has stopped");
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<Route> for Index {
    fn apply(&mut self, route: Route) {
        let Some(namespace) = route.namespace() else {
            tracing::warn!(name = %route.name_any(), "Route has no namespace");
            return;
        };
        let id = ResourceId::new(namespace, route.name_unchecked());

        let state = self.routes.entry(id.clone()).or_insert_with(|| {
            let mut state = RouteState::default();
            if let Some(status) = route.status.as_ref() {
                state.seed(status);
            }
            state
        });
        state.export = route.spec.export.to_string();
        state.import = route.spec.import.to_string();
        self.publish(&id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.routes.remove(&ResourceId::new(namespace, name));
    }
}

// === impl Report ===

impl Report {
    pub fn way(mut self, way: Vec<String>) -> Self {
        self.way = Some(way);
        self
    }

    pub fn condition(mut self, condition: RouteCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.way.is_none() && self.conditions.is_empty()
    }
}

// === impl RouteState ===

impl RouteState {
    /// Adopts the status written by a previous run so that a restart does
    /// not rewrite transition times.
    fn seed(&mut self, status: &RouteStatus) {
        for condition in &status.conditions {
            if let Ok(type_) = condition.type_.parse::<ConditionType>() {
                self.conditions.insert(type_, condition.clone());
            }
        }
        self.way = status.way.clone();
        self.last_synchronization = status.last_synchronization_timestamp.clone();
        self.patched = Some(status.clone());
    }

    fn set(&mut self, condition: &RouteCondition, now: &Time) {
        let status = condition.status();
        let last_transition_time = match self.conditions.get(&condition.type_) {
            Some(c) if c.status == status => c.last_transition_time.clone(),
            _ => {
                if condition.type_ == ConditionType::RouteSynced && condition.ready {
                    self.last_synchronization = Some(now.clone());
                }
                now.clone()
            }
        };
        self.conditions.insert(
            condition.type_,
            Condition {
                type_: condition.type_.to_string(),
                status: status.to_string(),
                reason: condition.reason.clone(),
                message: condition.message.clone(),
                last_transition_time,
                observed_generation: None,
            },
        );
    }

    fn render(&self) -> RouteStatus {
        let ready = ConditionType::ALL.iter().all(|t| {
            self.conditions
                .get(t)
                .map(|c| c.status == "True")
                .unwrap_or(false)
        });

        let mut conditions = self.conditions.values().cloned().collect::<Vec<_>>();
        if !conditions.is_empty() {
            let status = if ready { "True" } else { "False" };
            let (reason, message) = if ready {
                (REASON_READY.to_string(), String::new())
            } else {
                let pending = ConditionType::ALL
                    .iter()
                    .filter(|t| {
                        self.conditions
                            .get(t)
                            .map(|c| c.status != "True")
                            .unwrap_or(true)
                    })
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>();
                ("NotReady".to_string(), pending.join(","))
            };
            // The derived condition transitions together with its inputs.
            let last_transition_time = conditions
                .iter()
                .map(|c| c.last_transition_time.clone())
                .max_by_key(|t| t.0)
                .unwrap_or_else(now);
            conditions.push(Condition {
                type_: ROUTE_READY.to_string(),
                status: status.to_string(),
                reason,
                message,
                last_transition_time,
                observed_generation: None,
            });
        }

        RouteStatus {
            phase: if ready { PHASE_READY } else { PHASE_NOT_READY }.to_string(),
            way: self.way.clone(),
            export: self.export.clone(),
            import: self.import.clone(),
            last_synchronization_timestamp: self.last_synchronization.clone(),
            conditions,
        }
    }
}

fn now() -> Time {
    #[cfg(not(test))]
    let timestamp = Utc::now();
    #[cfg(test)]
    let timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;
    Time(timestamp)
}

pub(crate) fn make_patch(name: &str, status: &RouteStatus) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": API_VERSION,
        "kind": ROUTE_KIND,
        "name": name,
        "status": status,
    });
    k8s::Patch::Merge(value)
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: k8s::Client,
        index: SharedIndex,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            index,
            updates,
            patch_timeout,
            metrics,
        }
    }

    /// Applies status patches until every sender is dropped.
    pub async fn run(mut self) {
        let patch_params = k8s::PatchParams::apply(STATUS_CONTROLLER_NAME);

        while let Some(Update { id, patch }) = self.updates.recv().await {
            let api = k8s::Api::<Route>::namespaced(self.client.clone(), &id.namespace);

            let start = Instant::now();
            let patch = api.patch_status(&id.name, &patch_params, &patch);
            match time::timeout(self.patch_timeout, patch).await {
                Ok(Ok(_)) => {
                    self.metrics.patch_succeeded.inc();
                }
                Ok(Err(error)) => {
                    self.metrics.patch_failed.inc();
                    tracing::error!(%id.namespace, %id.name, %error, "Failed to patch Route status");
                    self.index.write().patch_failed(&id);
                }
                Err(_) => {
                    self.metrics.patch_timeout.inc();
                    tracing::error!(%id.namespace, %id.name, "Patching Route status timed out");
                    self.index.write().patch_failed(&id);
                }
            }
            self.metrics
                .patch_duration
                .observe(start.elapsed().as_secs_f64());
        }
        tracing::debug!("Status controller stopped");
    }
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patches_enqueued = Counter::default();
        prom.register(
            "patches_enqueued",
            "Count of status patches sent to the controller",
            patches_enqueued.clone(),
        );

        let patches_dropped = Counter::default();
        prom.register(
            "patches_dropped",
            "Count of status patches dropped because the queue was full",
            patches_dropped.clone(),
        );

        Self {
            patches_enqueued,
            patches_dropped,
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            patch_timeout.clone(),
        );

        let patch_duration =
            Histogram::new([0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0].into_iter());
        prom.register(
            "patch_duration_seconds",
            "Histogram of status patch latencies",
            patch_duration.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_duration,
        }
    }
}
