use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cluster participating in the federation.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "traffic.ferryproxy.io",
    version = "v1alpha2",
    kind = "Hub",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HubSpec {
    /// How peers reach this hub by default.
    #[serde(default)]
    pub gateway: HubSpecGateway,

    /// Replaces the default gateway as seen by specific peer hubs.
    #[serde(
        rename = "override",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub overrides: BTreeMap<String, HubSpecGateway>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSpecGateway {
    /// Whether peers can dial this hub's tunnel directly.
    #[serde(default)]
    pub reachable: bool,

    /// The `host:port` of the hub's tunnel.
    #[serde(default)]
    pub address: String,

    /// Hubs this hub goes through to dial out, farthest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub navigation_way: Vec<HubSpecGatewayWay>,

    /// Hubs peers go through to dial this hub, farthest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reception_way: Vec<HubSpecGatewayWay>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub navigation_proxy: Vec<HubSpecGatewayProxy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reception_proxy: Vec<HubSpecGatewayProxy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSpecGatewayWay {
    pub hub_name: String,
}

/// Either another hub's tunnel or an opaque proxy URI.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSpecGatewayProxy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl HubSpec {
    /// The gateway of this hub as seen by `for_hub`.
    pub fn gateway_for(&self, for_hub: &str) -> &HubSpecGateway {
        self.overrides.get(for_hub).unwrap_or(&self.gateway)
    }
}
