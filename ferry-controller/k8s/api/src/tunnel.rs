//! Data keys of the ConfigMaps read by the tunnel on each hub.

use serde::{Deserialize, Serialize};

/// JSON list of chains, in a `rules` ConfigMap.
pub const RULES_KEY: &str = "rules";

/// JSON map of peer hub to allow list, in an `allows` ConfigMap.
pub const ALLOWS_KEY: &str = "allows";

pub const AUTHORIZED_KEYS_KEY: &str = "authorized_keys";
pub const USER_KEY: &str = "user";

pub const EXPORT_HUB_NAME_KEY: &str = "export_hub_name";
pub const EXPORT_SERVICE_NAMESPACE_KEY: &str = "export_service_namespace";
pub const EXPORT_SERVICE_NAME_KEY: &str = "export_service_name";
pub const IMPORT_SERVICE_NAMESPACE_KEY: &str = "import_service_namespace";
pub const IMPORT_SERVICE_NAME_KEY: &str = "import_service_name";

/// JSON list of [`ServicePort`]s, in a `service` ConfigMap.
pub const PORTS_KEY: &str = "ports";

/// A port of the service the tunnel publishes on the import hub.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub protocol: String,
    pub port: u16,

    /// The bind port the tunnel listens on.
    pub target_port: u16,
}
