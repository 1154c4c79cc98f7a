//! Renders the ConfigMaps the tunnel on each hub consumes.

use crate::{
    core::{AllowList, Bound, Chain, Tunnel},
    k8s::{
        labels::{self, Config, Labels},
        tunnel, ConfigMap, ObjectMeta, ResourceExt, RouteSpec,
    },
};
use std::collections::BTreeMap;

/// The domain appended to the user of an authorized key.
const AUTHORIZED_DOMAIN: &str = "ferryproxy.io";

/// Rendered ConfigMaps keyed by hub, then by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resources(BTreeMap<String, BTreeMap<String, ConfigMap>>);

#[derive(Debug, thiserror::Error)]
#[error("failed to encode {name}: {source}")]
pub struct RenderError {
    name: String,
    #[source]
    source: serde_json::Error,
}

// === impl RenderError ===

impl RenderError {
    pub(crate) fn new(name: &str, source: serde_json::Error) -> Self {
        Self {
            name: name.to_string(),
            source,
        }
    }
}

// === impl Resources ===

impl Resources {
    pub fn insert(&mut self, hub: &str, cm: ConfigMap) {
        self.0
            .entry(hub.to_string())
            .or_default()
            .insert(cm.name_any(), cm);
    }

    pub fn merge(&mut self, other: Resources) {
        for (hub, cms) in other.0 {
            self.0.entry(hub).or_default().extend(cms);
        }
    }

    pub fn get(&self, hub: &str, name: &str) -> Option<&ConfigMap> {
        self.0.get(hub)?.get(name)
    }

    pub fn remove(&mut self, hub: &str, name: &str) -> Option<ConfigMap> {
        let cms = self.0.get_mut(hub)?;
        let cm = cms.remove(name);
        if cms.is_empty() {
            self.0.remove(hub);
        }
        cm
    }

    /// Iterates over `(hub, ConfigMap)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigMap)> {
        self.0
            .iter()
            .flat_map(|(hub, cms)| cms.values().map(move |cm| (hub.as_str(), cm)))
    }

    pub fn hubs(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The ConfigMaps of `next` that differ from or are missing in `self`.
    pub fn to_apply<'n>(&self, next: &'n Self) -> Vec<(&'n str, &'n ConfigMap)> {
        next.iter()
            .filter(|(hub, cm)| self.get(hub, &cm.name_any()) != Some(*cm))
            .collect()
    }

    /// The ConfigMaps of `self` that are absent from `next`.
    pub fn to_delete(&self, next: &Self) -> Vec<(String, String)> {
        self.iter()
            .filter(|(hub, cm)| next.get(hub, &cm.name_any()).is_none())
            .map(|(hub, cm)| (hub.to_string(), cm.name_any()))
            .collect()
    }
}

/// Adds the rules and allows of one tunnel to `resources`.
///
/// `authorized` returns the public key of a peer hub; peers without one get no
/// `authorized` ConfigMap.
pub fn bound<A>(
    resources: &mut Resources,
    pair: &Labels,
    tunnel: &Tunnel<'_>,
    bounds: &BTreeMap<String, Bound>,
    authorized: A,
) -> Result<(), RenderError>
where
    A: Fn(&str) -> Option<String>,
{
    for (hub, bound) in bounds {
        if !bound.outbound.is_empty() {
            resources.insert(hub, rules(pair, tunnel, &bound.outbound)?);
        }
        if !bound.inbound.is_empty() {
            resources.insert(hub, allows(pair, tunnel, &bound.inbound)?);
            for peer in bound.inbound.keys() {
                match authorized(peer) {
                    Some(key) => resources.insert(hub, authorized_keys(pair, peer, &key)),
                    None => tracing::warn!(%hub, %peer, "Peer has no authorized key"),
                }
            }
        }
    }
    Ok(())
}

pub fn rules(pair: &Labels, tunnel: &Tunnel<'_>, chains: &[Chain]) -> Result<ConfigMap, RenderError> {
    let name = format!(
        "{}-tunnel-{}-{}",
        tunnel.route, tunnel.export_port, tunnel.bind_port
    );
    let rules = encode(&name, chains)?;
    Ok(config_map(
        name,
        pair.clone().config(Config::Rules),
        [(tunnel::RULES_KEY, rules)],
    ))
}

pub fn allows(
    pair: &Labels,
    tunnel: &Tunnel<'_>,
    inbound: &BTreeMap<String, AllowList>,
) -> Result<ConfigMap, RenderError> {
    let name = format!(
        "{}-allows-{}-{}",
        tunnel.route, tunnel.export_port, tunnel.bind_port
    );
    let allows = encode(&name, inbound)?;
    Ok(config_map(
        name,
        pair.clone().config(Config::Allows),
        [(tunnel::ALLOWS_KEY, allows)],
    ))
}

pub fn authorized_keys(pair: &Labels, peer: &str, key: &str) -> ConfigMap {
    config_map(
        format!("{peer}-authorized"),
        pair.clone().config(Config::Authorized),
        [
            (tunnel::USER_KEY, peer.to_string()),
            (
                tunnel::AUTHORIZED_KEYS_KEY,
                format!("{key} {peer}@{AUTHORIZED_DOMAIN}"),
            ),
        ],
    )
}

/// The Service the tunnel publishes on the import hub.
pub fn service(
    pair: &Labels,
    route: &str,
    spec: &RouteSpec,
    ports: &[tunnel::ServicePort],
) -> Result<ConfigMap, RenderError> {
    let name = format!("{route}-service");
    let encoded = encode(&name, ports)?;
    let export = &spec.export.service;
    let import = &spec.import.service;
    let labels = pair
        .clone()
        .config(Config::Service)
        .with(labels::EXPORTED_FROM_NAMESPACE, &export.namespace)
        .with(labels::EXPORTED_FROM_NAME, &export.name)
        .with(
            labels::EXPORTED_FROM_PORTS,
            crate::core::ports::format_port_list(ports.iter().map(|p| p.port)),
        );
    Ok(config_map(
        name,
        labels,
        [
            (tunnel::EXPORT_HUB_NAME_KEY, spec.export.hub_name.clone()),
            (tunnel::EXPORT_SERVICE_NAMESPACE_KEY, export.namespace.clone()),
            (tunnel::EXPORT_SERVICE_NAME_KEY, export.name.clone()),
            (tunnel::IMPORT_SERVICE_NAMESPACE_KEY, import.namespace.clone()),
            (tunnel::IMPORT_SERVICE_NAME_KEY, import.name.clone()),
            (tunnel::PORTS_KEY, encoded),
        ],
    ))
}

/// Strips everything the API server adds, so that a listed ConfigMap compares
/// equal to the one it was rendered from.
pub fn normalize(cm: ConfigMap) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: cm.metadata.name,
            labels: cm.metadata.labels,
            ..Default::default()
        },
        data: cm.data,
        ..Default::default()
    }
}

fn config_map<const N: usize>(
    name: String,
    labels: Labels,
    data: [(&str, String); N],
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels.into_map()),
            ..Default::default()
        },
        data: Some(data.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
        ..Default::default()
    }
}

fn encode<T: serde::Serialize + ?Sized>(name: &str, value: &T) -> Result<String, RenderError> {
    serde_json::to_string(value).map_err(|source| RenderError::new(name, source))
}
