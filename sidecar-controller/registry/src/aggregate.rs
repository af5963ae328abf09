use crate::Platform;
use anyhow::Result;
use futures::FutureExt;
use sidecar_controller_core::{
    Controller, InstanceHandler, PortList, Registry, Service, ServiceAccounts, ServiceDiscovery,
    ServiceHandler, ServiceInstance,
};
use std::{collections::HashSet, fmt, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinSet;
use tracing::{debug, error, info_span, Instrument};


/// Aggregates data across registries and monitors them for changes.
///
/// Adapters are consulted in the order they were added.
#[derive(Default)]
pub struct Aggregate {
    adapters: Vec<Adapter>,
}

struct Adapter {
    platform: Platform,
    registry: Arc<dyn Registry>,
}

/// Indicates that an adapter refused a change handler.
///
/// Handlers already registered with earlier adapters are not unregistered.
#[derive(Debug, thiserror::Error)]
#[error("failed to append {kind} handler to {platform} registry")]
pub struct AppendHandlerError {
    pub platform: Platform,
    pub kind: HandlerKind,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    Service,
    Instance,
}

// === impl Aggregate ===

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an adapter.
    ///
    /// Adapters are expected to be added while composing the controller at startup; there is no
    /// way to remove one.
    pub fn add_adapter(&mut self, platform: Platform, registry: Arc<dyn Registry>) {
        debug!(%platform, "Adding registry adapter");
        self.adapters.push(Adapter { platform, registry });
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.adapters.iter().map(|a| &a.platform)
    }

    fn append_handler(
        &self,
        kind: HandlerKind,
        append: impl Fn(&dyn Registry) -> Result<()>,
    ) -> Result<(), AppendHandlerError> {
        for Adapter { platform, registry } in &self.adapters {
            if let Err(error) = append(registry.as_ref()) {
                debug!(%platform, %error, "Failed to append {kind} handler");
                return Err(AppendHandlerError {
                    platform: platform.clone(),
                    kind,
                    source: error.into(),
                });
            }
        }
        Ok(())
    }
}

impl ServiceDiscovery for Aggregate {
    /// Lists services from all platforms, in adapter order. Services are not deduplicated.
    fn services(&self) -> Vec<Service> {
        self.adapters
            .iter()
            .flat_map(|a| a.registry.services())
            .collect()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.adapters
            .iter()
            .find_map(|a| a.registry.get_service(hostname))
    }

    /// Returns the instances known to the first adapter that knows any. Results are not merged
    /// across adapters.
    fn instances(
        &self,
        hostname: &str,
        ports: &[String],
        tags: &[String],
    ) -> Vec<ServiceInstance> {
        self.adapters
            .iter()
            .map(|a| a.registry.instances(hostname, ports, tags))
            .find(|instances| !instances.is_empty())
            .unwrap_or_default()
    }

    fn host_instances(&self, addrs: &HashSet<String>) -> Vec<ServiceInstance> {
        self.adapters
            .iter()
            .flat_map(|a| a.registry.host_instances(addrs))
            .collect()
    }

    fn management_ports(&self, addr: &str) -> Option<PortList> {
        self.adapters
            .iter()
            .find_map(|a| a.registry.management_ports(addr))
    }
}

impl ServiceAccounts for Aggregate {
    fn service_accounts(&self, hostname: &str, ports: &[String]) -> Option<Vec<String>> {
        self.adapters
            .iter()
            .find_map(|a| a.registry.service_accounts(hostname, ports))
    }
}

#[async_trait::async_trait]
impl Controller for Aggregate {
    fn append_service_handler(&self, handler: ServiceHandler) -> Result<()> {
        self.append_handler(HandlerKind::Service, |registry| {
            registry.append_service_handler(handler.clone())
        })?;
        Ok(())
    }

    fn append_instance_handler(&self, handler: InstanceHandler) -> Result<()> {
        self.append_handler(HandlerKind::Instance, |registry| {
            registry.append_instance_handler(handler.clone())
        })?;
        Ok(())
    }

    /// Runs every adapter on its own task until `shutdown` is signaled.
    ///
    /// An adapter that fails or panics is logged and does not affect the others. Adapter tasks
    /// are detached, not aborted, once the signal is observed: each is expected to wind down on
    /// its own copy of the signal.
    async fn run(&self, shutdown: drain::Watch) {
        let mut tasks = JoinSet::new();
        for Adapter { platform, registry } in &self.adapters {
            let registry = registry.clone();
            let watch = shutdown.clone();
            let task_platform = platform.clone();
            tasks.spawn(
                async move {
                    let res = AssertUnwindSafe(registry.run(watch)).catch_unwind().await;
                    (task_platform, res.is_ok())
                }
                .instrument(info_span!("registry", %platform)),
            );
        }

        tokio::pin! {
            let signaled = shutdown.signaled();
        }
        loop {
            tokio::select! {
                _ = &mut signaled => break,
                Some(res) = tasks.join_next() => match res {
                    Ok((platform, true)) => debug!(%platform, "Registry terminated"),
                    Ok((platform, false)) => error!(%platform, "Registry panicked"),
                    Err(error) => error!(%error, "Registry task failed"),
                },
            }
        }

        tasks.detach_all();
        debug!("Registry aggregator terminated");
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Service => "service",
            Self::Instance => "instance",
        })
    }
}
