use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counters shared by every mapping controller.
#[derive(Clone, Debug, Default)]
pub struct MappingMetrics {
    syncs: Family<PairLabels, Counter>,
    sync_errors: Family<PairLabels, Counter>,
    applies: Family<HubLabels, Counter>,
    deletes: Family<HubLabels, Counter>,
    api_errors: Family<HubLabels, Counter>,
}

/// The counters of a single pair.
#[derive(Clone, Debug)]
pub struct PairMetrics {
    syncs: Counter,
    sync_errors: Counter,
    family: MappingMetrics,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PairLabels {
    export: String,
    import: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct HubLabels {
    hub: String,
}

// === impl MappingMetrics ===

impl MappingMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let syncs = Family::default();
        prom.register(
            "mapping_syncs",
            "Count of mapping synchronizations",
            syncs.clone(),
        );

        let sync_errors = Family::default();
        prom.register(
            "mapping_sync_errors",
            "Count of mapping synchronizations that did not converge",
            sync_errors.clone(),
        );

        let applies = Family::default();
        prom.register(
            "configmap_applies",
            "Count of ConfigMaps applied to hubs",
            applies.clone(),
        );

        let deletes = Family::default();
        prom.register(
            "configmap_deletes",
            "Count of ConfigMaps deleted from hubs",
            deletes.clone(),
        );

        let api_errors = Family::default();
        prom.register(
            "configmap_api_errors",
            "Count of failed ConfigMap API calls",
            api_errors.clone(),
        );

        Self {
            syncs,
            sync_errors,
            applies,
            deletes,
            api_errors,
        }
    }

    pub fn pair(&self, export: &str, import: &str) -> PairMetrics {
        let labels = PairLabels {
            export: export.to_string(),
            import: import.to_string(),
        };
        PairMetrics {
            syncs: self.syncs.get_or_create(&labels).clone(),
            sync_errors: self.sync_errors.get_or_create(&labels).clone(),
            family: self.clone(),
        }
    }
}

// === impl PairMetrics ===

impl PairMetrics {
    pub fn sync(&self) {
        self.syncs.inc();
    }

    pub fn sync_error(&self) {
        self.sync_errors.inc();
    }

    pub fn applied(&self, hub: &str) {
        self.family.applies.get_or_create(&hub_labels(hub)).inc();
    }

    pub fn deleted(&self, hub: &str) {
        self.family.deletes.get_or_create(&hub_labels(hub)).inc();
    }

    pub fn api_error(&self, hub: &str) {
        self.family.api_errors.get_or_create(&hub_labels(hub)).inc();
    }
}

fn hub_labels(hub: &str) -> HubLabels {
    HubLabels {
        hub: hub.to_string(),
    }
}
