use serde::Deserialize;
use sidecar_controller_core::{
    Endpoint, InvalidInstance, InvalidService, PortList, Service, ServiceInstance,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

/// A complete, static description of a registry's contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    /// Services by hostname.
    pub services: BTreeMap<String, Service>,
    pub instances: Vec<ServiceInstance>,

    /// Health-check ports by instance address.
    pub management_ports: HashMap<String, PortList>,

    /// Service accounts by service hostname.
    pub service_accounts: HashMap<String, Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Service(#[from] InvalidService),

    #[error(transparent)]
    Instance(#[from] InvalidInstance),

    #[error("service {0} is declared more than once")]
    DuplicateService(String),

    #[error("instance {address} refers to unknown service {service}")]
    UnknownService { address: String, service: String },

    #[error("instance {address} of {service} refers to unknown port {port:?}")]
    UnknownPort {
        address: String,
        service: String,
        port: String,
    },
}

/// The on-disk catalog format. Instances refer to their service by hostname.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CatalogSpec {
    #[serde(default)]
    services: Vec<Service>,
    #[serde(default)]
    instances: Vec<InstanceSpec>,
    #[serde(default)]
    management_ports: HashMap<String, PortList>,
    #[serde(default)]
    service_accounts: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct InstanceSpec {
    service: String,
    address: String,
    port: u16,
    /// May be omitted when the service declares a single port.
    #[serde(default)]
    port_name: Option<String>,
    #[serde(default)]
    tag: Option<String>,
}

// === impl Catalog ===

impl Catalog {
    pub async fn read(path: &Path) -> Result<Self, CatalogError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| CatalogError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&bytes)
    }

    /// Parses and validates a JSON catalog.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CatalogError> {
        let spec = serde_json::from_slice::<CatalogSpec>(bytes)?;

        let mut services = BTreeMap::new();
        for svc in spec.services {
            svc.validate()?;
            let hostname = svc.hostname();
            if services.insert(hostname.clone(), svc).is_some() {
                return Err(CatalogError::DuplicateService(hostname));
            }
        }

        let instances = spec
            .instances
            .into_iter()
            .map(|inst| inst.into_instance(&services))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            services,
            instances,
            management_ports: spec.management_ports,
            service_accounts: spec.service_accounts,
        })
    }

    pub fn with_service(mut self, svc: Service) -> Self {
        self.services.insert(svc.hostname(), svc);
        self
    }

    pub fn with_instance(mut self, instance: ServiceInstance) -> Self {
        self.instances.push(instance);
        self
    }
}

// === impl InstanceSpec ===

impl InstanceSpec {
    fn into_instance(
        self,
        services: &BTreeMap<String, Service>,
    ) -> Result<ServiceInstance, CatalogError> {
        let Self {
            service,
            address,
            port,
            port_name,
            tag,
        } = self;

        let Some(svc) = services.get(&service) else {
            return Err(CatalogError::UnknownService { address, service });
        };

        let service_port = match port_name.as_deref() {
            Some(name) => svc.ports.get(name),
            None if svc.ports.len() == 1 => svc.ports.iter().next(),
            None => None,
        };
        let Some(service_port) = service_port.cloned() else {
            return Err(CatalogError::UnknownPort {
                address,
                service,
                port: port_name.unwrap_or_default(),
            });
        };

        let instance = ServiceInstance {
            endpoint: Endpoint {
                address,
                port,
                service_port,
            },
            service: svc.clone(),
            tag,
        };
        instance.validate()?;
        Ok(instance)
    }
}
