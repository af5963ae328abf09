use crate::{Catalog, CatalogError, MemoryRegistry};
use anyhow::Result;
use sidecar_controller_core::{
    Controller, InstanceHandler, PortList, Service, ServiceAccounts, ServiceDiscovery,
    ServiceHandler, ServiceInstance,
};
use std::{collections::HashSet, path::PathBuf};
use tokio::time;
use tracing::{debug, info, warn};

/// A registry backed by a JSON catalog file.
///
/// The file is loaded when the registry is built and polled while the registry runs. Changes are
/// applied to an in-memory registry, which notifies handlers of each difference. A file that can
/// no longer be read or validated leaves the prior catalog in place.
pub struct FileRegistry {
    path: PathBuf,
    interval: time::Duration,
    memory: MemoryRegistry,
}

// === impl FileRegistry ===

impl FileRegistry {
    pub async fn load(
        path: impl Into<PathBuf>,
        interval: time::Duration,
    ) -> Result<Self, CatalogError> {
        let path = path.into();
        let catalog = Catalog::read(&path).await?;
        info!(
            path = %path.display(),
            services = catalog.services.len(),
            instances = catalog.instances.len(),
            "Loaded registry catalog"
        );
        Ok(Self {
            path,
            interval,
            memory: MemoryRegistry::new(catalog),
        })
    }

    async fn sync(&self) {
        match Catalog::read(&self.path).await {
            Ok(catalog) => {
                let changes = self.memory.replace(catalog);
                if changes > 0 {
                    info!(path = %self.path.display(), changes, "Registry catalog updated");
                }
            }
            Err(error) => {
                warn!(path = %self.path.display(), %error, "Failed to reload registry catalog");
            }
        }
    }
}

impl ServiceDiscovery for FileRegistry {
    fn services(&self) -> Vec<Service> {
        self.memory.services()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.memory.get_service(hostname)
    }

    fn instances(
        &self,
        hostname: &str,
        ports: &[String],
        tags: &[String],
    ) -> Vec<ServiceInstance> {
        self.memory.instances(hostname, ports, tags)
    }

    fn host_instances(&self, addrs: &HashSet<String>) -> Vec<ServiceInstance> {
        self.memory.host_instances(addrs)
    }

    fn management_ports(&self, addr: &str) -> Option<PortList> {
        self.memory.management_ports(addr)
    }
}

impl ServiceAccounts for FileRegistry {
    fn service_accounts(&self, hostname: &str, ports: &[String]) -> Option<Vec<String>> {
        self.memory.service_accounts(hostname, ports)
    }
}

#[async_trait::async_trait]
impl Controller for FileRegistry {
    fn append_service_handler(&self, handler: ServiceHandler) -> Result<()> {
        self.memory.append_service_handler(handler)
    }

    fn append_instance_handler(&self, handler: InstanceHandler) -> Result<()> {
        self.memory.append_instance_handler(handler)
    }

    async fn run(&self, shutdown: drain::Watch) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the catalog was loaded on construction.
        interval.tick().await;

        tokio::pin! {
            let signaled = shutdown.signaled();
        }
        loop {
            tokio::select! {
                _ = &mut signaled => {
                    debug!(path = %self.path.display(), "Registry file watch terminated");
                    return;
                }
                _ = interval.tick() => self.sync().await,
            }
        }
    }
}
