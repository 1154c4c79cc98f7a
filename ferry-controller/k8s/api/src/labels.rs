//! Labels carried by the ConfigMaps the controller writes to hubs.

use std::{collections::BTreeMap, fmt, str::FromStr};

pub type Map = BTreeMap<String, String>;

/// What a tunnel ConfigMap configures.
pub const TUNNEL_CONFIG: &str = "tunnel.ferryproxy.io/config";

pub const EXPORTED_FROM: &str = "ferry.ferryproxy.io/exported-from";
pub const IMPORTED_TO: &str = "ferry.ferryproxy.io/imported-to";

pub const EXPORTED_FROM_NAMESPACE: &str = "ferry.ferryproxy.io/exported-from-namespace";
pub const EXPORTED_FROM_NAME: &str = "ferry.ferryproxy.io/exported-from-name";

/// Dash-separated list of the exported service ports, e.g. `80-443`.
pub const EXPORTED_FROM_PORTS: &str = "ferry.ferryproxy.io/exported-from-ports";

pub const MANAGED_BY: &str = "ferry.ferryproxy.io/managed-by";
pub const MANAGED_BY_CONTROLLER: &str = "ferry-controller";

/// Values of the [`TUNNEL_CONFIG`] label.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Config {
    Rules,
    Allows,
    Authorized,
    Service,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown tunnel config kind {0:?}")]
pub struct InvalidConfig(String);

/// A label set, built up with chained inserts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(Map);

// === impl Config ===

impl Config {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rules => "rules",
            Self::Allows => "allows",
            Self::Authorized => "authorized",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Config {
    type Err = InvalidConfig;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rules" => Ok(Self::Rules),
            "allows" => Ok(Self::Allows),
            "authorized" => Ok(Self::Authorized),
            "service" => Ok(Self::Service),
            s => Err(InvalidConfig(s.to_string())),
        }
    }
}

// === impl Labels ===

impl Labels {
    /// The labels every resource owned by an (export, import) pair carries.
    pub fn pair(export: &str, import: &str) -> Self {
        Self::default()
            .with(EXPORTED_FROM, export)
            .with(IMPORTED_TO, import)
            .with(MANAGED_BY, MANAGED_BY_CONTROLLER)
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn config(self, config: Config) -> Self {
        self.with(TUNNEL_CONFIG, config)
    }

    /// Renders the labels as an equality-based label selector.
    pub fn selector(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Checks that every label in `self` is present in `labels`.
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn into_map(self) -> Map {
        self.0
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        &self.0
    }
}

impl From<Labels> for Map {
    fn from(Labels(map): Labels) -> Self {
        map
    }
}

/// Reads the tunnel config kind of a labeled resource.
pub fn config_of(labels: &Map) -> Option<Config> {
    labels.get(TUNNEL_CONFIG)?.parse().ok()
}
