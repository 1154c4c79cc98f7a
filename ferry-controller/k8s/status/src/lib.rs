//! Maintains `Route` statuses.
//!
//! Controllers report conditions to the [`Index`], which renders the full
//! status of a route and hands a merge patch to the [`Controller`] whenever
//! it changes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod conditions;
mod index;
mod resource_id;


pub use self::{
    conditions::{
        ConditionType, RouteCondition, UnknownCondition, PHASE_NOT_READY, PHASE_READY, ROUTE_READY,
    },
    index::{
        Controller, ControllerMetrics, Index, IndexMetrics, Report, SharedIndex, Update,
        STATUS_CONTROLLER_NAME,
    },
    resource_id::ResourceId,
};
