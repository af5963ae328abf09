//! Sidecar Controller core model
//!
//! A mesh topology is described by [`Service`]s, each declaring a set of tags and named ports, and
//! by [`ServiceInstance`]s, each binding a network [`Endpoint`] to a service and (for tagged
//! services) exactly one of that service's tags.
//!
//! Platform adapters expose this model through the capability traits in this crate:
//!
//! ```text
//! [ ServiceDiscovery ] + [ ServiceAccounts ] + [ Controller ] = [ Registry ]
//! ```
//!
//! Adapters produce fresh values for every query. Nothing returned by a registry is shared or
//! mutated after the fact, so callers may hold onto snapshots freely.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod discovery;
mod service;
pub mod validation;

pub use self::{
    discovery::{
        Controller, Event, InstanceHandler, Registry, ServiceAccounts, ServiceDiscovery,
        ServiceHandler,
    },
    service::{Endpoint, ParseServiceError, Port, PortList, Protocol, Service, ServiceInstance},
    validation::{InvalidInstance, InvalidService},
};
