use std::{fmt, str::FromStr};

/// Conditions reported by the route and mapping controllers.
///
/// `RouteReady` is not listed here: it is derived from these whenever a
/// status is rendered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionType {
    PortsAllocated,
    ExportHubReady,
    ImportHubReady,
    PathReachable,
    RouteSynced,
}

pub const ROUTE_READY: &str = "RouteReady";
pub const PHASE_READY: &str = "RouteReady";
pub const PHASE_NOT_READY: &str = "NotReady";

/// The reason of a satisfied `RouteReady` condition.
pub const REASON_READY: &str = "Ready";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteCondition {
    pub type_: ConditionType,
    pub ready: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown condition type: {0}")]
pub struct UnknownCondition(String);

// === impl ConditionType ===

impl ConditionType {
    pub const ALL: [Self; 5] = [
        Self::PortsAllocated,
        Self::ExportHubReady,
        Self::ImportHubReady,
        Self::PathReachable,
        Self::RouteSynced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortsAllocated => "PortsAllocated",
            Self::ExportHubReady => "ExportHubReady",
            Self::ImportHubReady => "ImportHubReady",
            Self::PathReachable => "PathReachable",
            Self::RouteSynced => "RouteSynced",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionType {
    type Err = UnknownCondition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownCondition(s.to_string()))
    }
}

// === impl RouteCondition ===

impl RouteCondition {
    pub fn ready(type_: ConditionType, reason: impl ToString, message: impl ToString) -> Self {
        Self {
            type_,
            ready: true,
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    pub fn not_ready(type_: ConditionType, reason: impl ToString, message: impl ToString) -> Self {
        Self {
            type_,
            ready: false,
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn status(&self) -> &'static str {
        if self.ready {
            "True"
        } else {
            "False"
        }
    }
}
