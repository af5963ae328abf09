//! Renders a topology snapshot into the proxy's JSON configuration.

use crate::MeshConfig;
use serde::Serialize;
use sidecar_controller_core::{InvalidService, Port, Protocol, Service};
use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::Path,
};

const LB_ROUND_ROBIN: &str = "round_robin";
const DISCOVERY_CLUSTER: &str = "sds";
const DISCOVERY_REFRESH_DELAY_MS: u64 = 1_000;
const WILDCARD: &str = "0.0.0.0";

/// A complete proxy configuration.
///
/// Configurations compare structurally; two configurations generated from equivalent topologies
/// are equal regardless of the order in which services were listed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Config {
    pub listeners: Vec<Listener>,
    pub admin: Admin,
    pub cluster_manager: ClusterManager,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub bind_to_port: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_original_dst: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    HttpConnectionManager { virtual_hosts: Vec<VirtualHost> },
    TcpProxy { cluster: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub cluster: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Admin {
    pub access_log_path: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterManager {
    pub clusters: Vec<Cluster>,
    pub sds: Discovery,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub connect_timeout_ms: u64,
    #[serde(rename = "type")]
    pub kind: ClusterKind,
    pub lb_type: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Host>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    Sds,
    StrictDns,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Host {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub cluster: Cluster,
    pub refresh_delay_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error(transparent)]
    InvalidService(#[from] InvalidService),

    #[error("port {port} is claimed by conflicting services: {}", .services.join(", "))]
    PortConflict { port: u16, services: Vec<String> },

    #[error("port {port} of {service} is reserved for the proxy")]
    ReservedPort { port: u16, service: String },
}

/// Generates a proxy configuration for the given services.
///
/// Services are merged by hostname, so a service listed more than once contributes only its
/// first occurrence. Every service must be valid. HTTP-family ports may be shared by any number
/// of services, each routed by hostname; a TCP port must belong to a single service. UDP ports
/// are not proxied.
pub fn generate(services: &[Service], mesh: &MeshConfig) -> Result<Config, GenerateError> {
    let mut seen = HashSet::new();
    let mut by_port = BTreeMap::<u16, Vec<(&Service, &Port)>>::new();
    for svc in services {
        if !seen.insert(svc.hostname()) {
            continue;
        }
        svc.validate()?;

        for port in &svc.ports {
            if port.protocol == Protocol::Udp {
                continue;
            }
            if port.port == mesh.proxy_listen_port || port.port == mesh.proxy_admin_port {
                return Err(GenerateError::ReservedPort {
                    port: port.port,
                    service: svc.hostname(),
                });
            }
            by_port.entry(port.port).or_default().push((svc, port));
        }
    }

    let mut listeners = vec![Listener {
        name: "virtual".to_string(),
        address: format!("tcp://{WILDCARD}:{}", mesh.proxy_listen_port),
        bind_to_port: true,
        use_original_dst: true,
        filter: None,
    }];
    let mut clusters = Vec::new();

    for (port, mut targets) in by_port {
        targets.sort_by_key(|(svc, _)| svc.hostname());

        let filter = if targets.iter().all(|(_, p)| p.protocol.is_http()) {
            let virtual_hosts = targets
                .iter()
                .map(|(svc, p)| {
                    let hostname = svc.hostname();
                    VirtualHost {
                        name: format!("{hostname}:{port}"),
                        domains: vec![hostname.clone(), format!("{hostname}:{port}")],
                        cluster: cluster_name(&hostname, p),
                    }
                })
                .collect();
            Filter::HttpConnectionManager { virtual_hosts }
        } else {
            let [(svc, p)] = targets.as_slice() else {
                return Err(GenerateError::PortConflict {
                    port,
                    services: targets.iter().map(|(s, _)| s.hostname()).collect(),
                });
            };
            Filter::TcpProxy {
                cluster: cluster_name(&svc.hostname(), p),
            }
        };

        let kind = match filter {
            Filter::HttpConnectionManager { .. } => "http",
            Filter::TcpProxy { .. } => "tcp",
        };
        listeners.push(Listener {
            name: format!("{kind}_{WILDCARD}_{port}"),
            address: format!("tcp://{WILDCARD}:{port}"),
            bind_to_port: false,
            use_original_dst: false,
            filter: Some(filter),
        });

        clusters.extend(targets.iter().map(|(svc, p)| {
            let hostname = svc.hostname();
            Cluster {
                name: cluster_name(&hostname, p),
                service_name: Some(format!("{hostname}|{}", port_key(p))),
                connect_timeout_ms: mesh.connect_timeout_ms,
                kind: ClusterKind::Sds,
                lb_type: LB_ROUND_ROBIN,
                hosts: vec![],
            }
        }));
    }
    clusters.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Config {
        listeners,
        admin: Admin {
            access_log_path: "/dev/stdout".to_string(),
            address: format!("tcp://127.0.0.1:{}", mesh.proxy_admin_port),
        },
        cluster_manager: ClusterManager {
            clusters,
            sds: Discovery {
                cluster: Cluster {
                    name: DISCOVERY_CLUSTER.to_string(),
                    service_name: None,
                    connect_timeout_ms: mesh.connect_timeout_ms,
                    kind: ClusterKind::StrictDns,
                    lb_type: LB_ROUND_ROBIN,
                    hosts: vec![Host {
                        url: format!("tcp://{}", mesh.discovery_address),
                    }],
                },
                refresh_delay_ms: DISCOVERY_REFRESH_DELAY_MS,
            },
        },
    })
}

fn cluster_name(hostname: &str, port: &Port) -> String {
    format!("out.{hostname}|{}", port_key(port))
}

/// Unnamed ports are keyed by number.
fn port_key(port: &Port) -> String {
    if port.name.is_empty() {
        return port.port.to_string();
    }
    port.name.clone()
}

// === impl Config ===

impl Config {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Writes the configuration to `path` as JSON, replacing any existing file.
    pub fn write_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.cluster_manager.clusters.iter()
    }
}
