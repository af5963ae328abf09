use crate::Catalog;
use anyhow::Result;
use parking_lot::RwLock;
use sidecar_controller_core::{
    Controller, Event, InstanceHandler, PortList, Service, ServiceAccounts, ServiceDiscovery,
    ServiceHandler, ServiceInstance,
};
use std::collections::HashSet;
use tracing::debug;

/// A mutable, in-process registry.
///
/// Every mutation notifies the registered handlers of exactly the services and instances it
/// changed. Handlers are invoked after the registry's lock has been released, so they may query
/// the registry.
#[derive(Default)]
pub struct MemoryRegistry {
    catalog: RwLock<Catalog>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
}

#[derive(Default)]
struct Changes {
    services: Vec<(Service, Event)>,
    instances: Vec<(ServiceInstance, Event)>,
}

// === impl MemoryRegistry ===

impl MemoryRegistry {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            ..Default::default()
        }
    }

    /// Adds or updates a service.
    pub fn add_service(&self, svc: Service) {
        let mut changes = Changes::default();
        {
            let mut catalog = self.catalog.write();
            let event = match catalog.services.insert(svc.hostname(), svc.clone()) {
                None => Event::Add,
                Some(prior) if prior == svc => return,
                Some(_) => Event::Update,
            };
            changes.services.push((svc, event));
        }
        self.notify(changes);
    }

    /// Removes a service and all of its instances.
    pub fn remove_service(&self, hostname: &str) -> Option<Service> {
        let mut changes = Changes::default();
        let removed = {
            let mut catalog = self.catalog.write();
            let svc = catalog.services.remove(hostname)?;
            catalog.instances.retain(|inst| {
                if inst.service.hostname() == hostname {
                    changes.instances.push((inst.clone(), Event::Delete));
                    return false;
                }
                true
            });
            changes.services.push((svc.clone(), Event::Delete));
            svc
        };
        self.notify(changes);
        Some(removed)
    }

    pub fn add_instance(&self, instance: ServiceInstance) {
        {
            let mut catalog = self.catalog.write();
            if catalog.instances.contains(&instance) {
                return;
            }
            catalog.instances.push(instance.clone());
        }
        self.notify(Changes {
            instances: vec![(instance, Event::Add)],
            ..Default::default()
        });
    }

    pub fn remove_instance(&self, instance: &ServiceInstance) -> bool {
        {
            let mut catalog = self.catalog.write();
            let before = catalog.instances.len();
            catalog.instances.retain(|inst| inst != instance);
            if catalog.instances.len() == before {
                return false;
            }
        }
        self.notify(Changes {
            instances: vec![(instance.clone(), Event::Delete)],
            ..Default::default()
        });
        true
    }

    pub fn set_management_ports(&self, addr: impl ToString, ports: PortList) {
        self.catalog
            .write()
            .management_ports
            .insert(addr.to_string(), ports);
    }

    pub fn set_service_accounts(&self, hostname: impl ToString, accounts: Vec<String>) {
        self.catalog
            .write()
            .service_accounts
            .insert(hostname.to_string(), accounts);
    }

    /// Replaces the registry's contents, notifying handlers of every difference. Returns the
    /// number of changes observed.
    pub fn replace(&self, next: Catalog) -> usize {
        let changes = {
            let mut catalog = self.catalog.write();
            let changes = Changes::between(&catalog, &next);
            *catalog = next;
            changes
        };
        let n = changes.services.len() + changes.instances.len();
        self.notify(changes);
        n
    }

    pub fn catalog(&self) -> Catalog {
        self.catalog.read().clone()
    }

    /// Instances are deleted before their services and added after them.
    fn notify(&self, Changes { services, instances }: Changes) {
        let (deleted, instances): (Vec<_>, Vec<_>) = instances
            .into_iter()
            .partition(|(_, event)| *event == Event::Delete);
        self.notify_instances(&deleted);
        self.notify_services(&services);
        self.notify_instances(&instances);
    }

    fn notify_services(&self, services: &[(Service, Event)]) {
        if services.is_empty() {
            return;
        }
        let handlers = self.service_handlers.read().clone();
        for (svc, event) in services {
            debug!(service = %svc, %event, "Service changed");
            for handler in &handlers {
                handler(svc, *event);
            }
        }
    }

    fn notify_instances(&self, instances: &[(ServiceInstance, Event)]) {
        if instances.is_empty() {
            return;
        }
        let handlers = self.instance_handlers.read().clone();
        for (inst, event) in instances {
            debug!(address = %inst.endpoint.address, service = %inst.service, %event, "Instance changed");
            for handler in &handlers {
                handler(inst, *event);
            }
        }
    }
}

impl ServiceDiscovery for MemoryRegistry {
    fn services(&self) -> Vec<Service> {
        self.catalog.read().services.values().cloned().collect()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.catalog.read().services.get(hostname).cloned()
    }

    fn instances(
        &self,
        hostname: &str,
        ports: &[String],
        tags: &[String],
    ) -> Vec<ServiceInstance> {
        self.catalog
            .read()
            .instances
            .iter()
            .filter(|inst| inst.service.hostname() == hostname && inst.matches(ports, tags))
            .cloned()
            .collect()
    }

    fn host_instances(&self, addrs: &HashSet<String>) -> Vec<ServiceInstance> {
        self.catalog
            .read()
            .instances
            .iter()
            .filter(|inst| addrs.contains(&inst.endpoint.address))
            .cloned()
            .collect()
    }

    fn management_ports(&self, addr: &str) -> Option<PortList> {
        self.catalog.read().management_ports.get(addr).cloned()
    }
}

impl ServiceAccounts for MemoryRegistry {
    /// Accounts are recorded per service, so `ports` does not narrow the result.
    fn service_accounts(&self, hostname: &str, _ports: &[String]) -> Option<Vec<String>> {
        self.catalog.read().service_accounts.get(hostname).cloned()
    }
}

#[async_trait::async_trait]
impl Controller for MemoryRegistry {
    fn append_service_handler(&self, handler: ServiceHandler) -> Result<()> {
        self.service_handlers.write().push(handler);
        Ok(())
    }

    fn append_instance_handler(&self, handler: InstanceHandler) -> Result<()> {
        self.instance_handlers.write().push(handler);
        Ok(())
    }

    /// There is nothing to synchronize; wait for shutdown.
    async fn run(&self, shutdown: drain::Watch) {
        let _ = shutdown.signaled().await;
    }
}

// === impl Changes ===

impl Changes {
    fn between(prior: &Catalog, next: &Catalog) -> Self {
        let mut changes = Self::default();

        for (hostname, svc) in &next.services {
            match prior.services.get(hostname) {
                None => changes.services.push((svc.clone(), Event::Add)),
                Some(p) if p != svc => changes.services.push((svc.clone(), Event::Update)),
                Some(_) => {}
            }
        }
        for (hostname, svc) in &prior.services {
            if !next.services.contains_key(hostname) {
                changes.services.push((svc.clone(), Event::Delete));
            }
        }

        let prior_instances = prior.instances.iter().collect::<HashSet<_>>();
        let next_instances = next.instances.iter().collect::<HashSet<_>>();
        for inst in &prior.instances {
            if !next_instances.contains(inst) {
                changes.instances.push((inst.clone(), Event::Delete));
            }
        }
        for inst in &next.instances {
            if !prior_instances.contains(inst) {
                changes.instances.push((inst.clone(), Event::Add));
            }
        }

        changes
    }
}
