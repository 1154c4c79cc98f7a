//! Recovers bind port assignments from resources already present on hubs.
//!
//! Two sources are read when a hub or a pair is (re)initialized:
//!
//! - Services in an import hub's tunnel namespace, labeled with the exported
//!   service and its ports. Each exported port is found by the
//!   `-<port>` suffix of the Service port's name and bound to its target port.
//! - `service` ConfigMaps written for a pair, whose `ports` entries record the
//!   bind port of each exported port as their target port.

use ferry_controller_core::{ports::parse_port_list, PortError, PortPeer};
use ferry_controller_k8s_api::{labels, tunnel, ConfigMap, IntOrString, ResourceExt, Service};

/// Recovered `(peer, bind port)` assignments.
pub type Peers = Vec<(PortPeer, u16)>;

/// Reads the assignments published by a tunnel Service.
///
/// Services without the export labels are not tunnel Services and yield
/// nothing.
pub fn from_service(svc: &Service) -> Result<Peers, PortError> {
    let meta = svc.labels();
    let (Some(export), Some(ns), Some(name), Some(ports)) = (
        meta.get(labels::EXPORTED_FROM),
        meta.get(labels::EXPORTED_FROM_NAMESPACE),
        meta.get(labels::EXPORTED_FROM_NAME),
        meta.get(labels::EXPORTED_FROM_PORTS),
    ) else {
        return Ok(Vec::new());
    };

    let svc_ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();

    let mut peers = Vec::new();
    for port in parse_port_list(ports)? {
        let suffix = format!("-{port}");
        let Some(svc_port) = svc_ports
            .iter()
            .find(|p| p.name.as_deref().is_some_and(|n| n.ends_with(&suffix)))
        else {
            tracing::debug!(service = %svc.name_any(), port, "Exported port not published");
            continue;
        };

        let bind = match svc_port.target_port {
            Some(IntOrString::Int(port)) => port,
            _ => svc_port.port,
        };
        let bind = u16::try_from(bind).map_err(|_| PortError::InvalidPort(bind.to_string()))?;
        peers.push((PortPeer::new(export, ns, name, port), bind));
    }
    Ok(peers)
}

/// Reads the assignments recorded in a `service` ConfigMap.
pub fn from_config_map(cm: &ConfigMap) -> Result<Peers, PortError> {
    if labels::config_of(cm.labels()) != Some(labels::Config::Service) {
        return Ok(Vec::new());
    }
    let data = cm.data.as_ref();
    let get = |key: &str| data.and_then(|d| d.get(key));

    let (Some(export), Some(ns), Some(name)) = (
        cm.labels().get(labels::EXPORTED_FROM),
        get(tunnel::EXPORT_SERVICE_NAMESPACE_KEY),
        get(tunnel::EXPORT_SERVICE_NAME_KEY),
    ) else {
        return Ok(Vec::new());
    };
    let Some(ports) = get(tunnel::PORTS_KEY) else {
        return Ok(Vec::new());
    };

    let ports = serde_json::from_str::<Vec<tunnel::ServicePort>>(ports)
        .map_err(|_| PortError::InvalidPort(ports.clone()))?;
    Ok(ports
        .into_iter()
        .map(|p| (PortPeer::new(export, ns, name, p.port), p.target_port))
        .collect())
}
