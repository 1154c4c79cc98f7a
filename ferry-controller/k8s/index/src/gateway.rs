use ferry_controller_core::{Gateway, Hop};
use ferry_controller_k8s_api::traffic::{HubSpecGateway, HubSpecGatewayProxy};

pub(crate) fn from_spec(spec: &HubSpecGateway) -> Gateway {
    Gateway {
        reachable: spec.reachable,
        address: spec.address.clone(),
        navigation_way: spec
            .navigation_way
            .iter()
            .map(|w| w.hub_name.clone())
            .collect(),
        reception_way: spec
            .reception_way
            .iter()
            .map(|w| w.hub_name.clone())
            .collect(),
        navigation_proxy: hops(&spec.navigation_proxy),
        reception_proxy: hops(&spec.reception_proxy),
    }
}

/// Hub references win over proxy URIs; entries naming neither are dropped.
fn hops(proxies: &[HubSpecGatewayProxy]) -> Vec<Hop> {
    proxies
        .iter()
        .filter_map(|p| match (&p.hub_name, &p.proxy) {
            (Some(hub), _) if !hub.is_empty() => Some(Hop::Hub(hub.clone())),
            (_, Some(uri)) if !uri.is_empty() => Some(Hop::Proxy(uri.clone())),
            _ => {
                tracing::warn!(?p, "Ignoring empty proxy hop");
                None
            }
        })
        .collect()
}
