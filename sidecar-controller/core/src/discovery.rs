use crate::{PortList, Service, ServiceInstance};
use anyhow::Result;
use std::{collections::HashSet, fmt, sync::Arc};

/// Describes a change to a registry resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    Add,
    Update,
    Delete,
}

/// Invoked by a registry whenever a service changes.
pub type ServiceHandler = Arc<dyn Fn(&Service, Event) + Send + Sync>;

/// Invoked by a registry whenever a service instance changes.
pub type InstanceHandler = Arc<dyn Fn(&ServiceInstance, Event) + Send + Sync>;

/// Enumerates services and their instances.
pub trait ServiceDiscovery: Send + Sync {
    /// Lists all services.
    fn services(&self) -> Vec<Service>;

    /// Retrieves a service by hostname, if it exists.
    fn get_service(&self, hostname: &str) -> Option<Service>;

    /// Retrieves the instances of a service on the named ports that carry any of the given tags.
    ///
    /// An empty port list matches every port and an empty tag list matches every instance.
    fn instances(&self, hostname: &str, ports: &[String], tags: &[String])
        -> Vec<ServiceInstance>;

    /// Lists the service instances bound to any of the given addresses.
    fn host_instances(&self, addrs: &HashSet<String>) -> Vec<ServiceInstance>;

    /// Retrieves the health-check ports exposed by the instance at `addr`.
    fn management_ports(&self, addr: &str) -> Option<PortList>;
}

/// Resolves the identities a service's workloads run as.
pub trait ServiceAccounts: Send + Sync {
    /// Lists the service accounts backing a service on the named ports.
    fn service_accounts(&self, hostname: &str, ports: &[String]) -> Option<Vec<String>>;
}

/// Drives a registry's synchronization and publishes its changes.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Registers a handler to be notified of service changes.
    fn append_service_handler(&self, handler: ServiceHandler) -> Result<()>;

    /// Registers a handler to be notified of instance changes.
    fn append_instance_handler(&self, handler: InstanceHandler) -> Result<()>;

    /// Synchronizes the registry until `shutdown` is signaled.
    async fn run(&self, shutdown: drain::Watch);
}

/// The full capability set of a service registry.
pub trait Registry: Controller + ServiceDiscovery + ServiceAccounts {}

impl<T> Registry for T where T: Controller + ServiceDiscovery + ServiceAccounts {}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}
