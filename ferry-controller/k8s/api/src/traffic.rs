//! Resources in the `traffic.ferryproxy.io` group.

pub mod hub;
pub mod route;

pub use self::{
    hub::{Hub, HubSpec, HubSpecGateway, HubSpecGatewayProxy, HubSpecGatewayWay},
    route::{Route, RouteSpec, RouteSpecRule, RouteSpecRuleService, RouteStatus},
};

pub const API_GROUP: &str = "traffic.ferryproxy.io";
pub const API_VERSION: &str = "traffic.ferryproxy.io/v1alpha2";
pub const ROUTE_KIND: &str = "Route";
