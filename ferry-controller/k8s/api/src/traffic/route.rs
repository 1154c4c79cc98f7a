use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Publishes a service of one hub as a service of another hub.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "traffic.ferryproxy.io",
    version = "v1alpha2",
    kind = "Route",
    namespaced,
    status = "RouteStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub export: RouteSpecRule,
    pub import: RouteSpecRule,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpecRule {
    #[serde(default)]
    pub hub_name: String,
    pub service: RouteSpecRuleService,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct RouteSpecRuleService {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    /// The hubs the tunnel traverses, joined by `,`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub way: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub export: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub import: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synchronization_timestamp: Option<Time>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RouteSpec {
    /// A route must join two distinct, named hubs.
    pub fn is_valid(&self) -> bool {
        !self.export.hub_name.is_empty()
            && !self.import.hub_name.is_empty()
            && self.export.hub_name != self.import.hub_name
    }
}

impl fmt::Display for RouteSpecRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.hub_name, self.service.namespace, self.service.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(hub: &str) -> RouteSpecRule {
        RouteSpecRule {
            hub_name: hub.to_string(),
            service: RouteSpecRuleService {
                namespace: "test".to_string(),
                name: "svc1".to_string(),
            },
        }
    }

    #[test]
    fn validity() {
        let spec = |e: &str, i: &str| RouteSpec {
            export: rule(e),
            import: rule(i),
        };
        assert!(spec("export", "import").is_valid());
        assert!(!spec("export", "export").is_valid());
        assert!(!spec("", "import").is_valid());
        assert!(!spec("export", "").is_valid());
    }

    #[test]
    fn displays_rule() {
        assert_eq!(rule("export").to_string(), "export/test/svc1");
    }

    #[test]
    fn parses_spec() {
        let spec: RouteSpec = serde_json::from_value(serde_json::json!({
            "export": { "hubName": "export", "service": { "namespace": "test", "name": "svc1" } },
            "import": { "hubName": "import", "service": { "namespace": "default", "name": "svc1" } },
        }))
        .unwrap();
        assert_eq!(spec.export, rule("export"));
        assert_eq!(spec.import.service.namespace, "default");
    }
}
