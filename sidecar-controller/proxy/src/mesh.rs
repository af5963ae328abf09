use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Mesh-wide settings applied to every generated proxy configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MeshConfig {
    /// The port on which the proxy captures redirected traffic.
    pub proxy_listen_port: u16,

    pub proxy_admin_port: u16,

    /// The `host:port` of the endpoint discovery service queried by the proxy.
    pub discovery_address: String,

    pub connect_timeout_ms: u64,

    /// How long a draining proxy keeps serving established connections during a hot restart.
    pub drain_duration_secs: u64,

    /// How long a new proxy waits before shutting down its parent during a hot restart.
    pub parent_shutdown_duration_secs: u64,

    pub service_cluster: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MeshConfigError {
    #[error("failed to read mesh configuration {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse mesh configuration {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// === impl MeshConfig ===

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            proxy_listen_port: 15001,
            proxy_admin_port: 15000,
            discovery_address: "istio-pilot:8080".to_string(),
            connect_timeout_ms: 1_000,
            drain_duration_secs: 2,
            parent_shutdown_duration_secs: 3,
            service_cluster: "istio-proxy".to_string(),
        }
    }
}

impl MeshConfig {
    /// Reads mesh settings from a JSON file. Fields missing from the file take their defaults.
    pub async fn read(path: &Path) -> Result<Self, MeshConfigError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| MeshConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| MeshConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_duration(&self) -> Duration {
        Duration::from_secs(self.drain_duration_secs)
    }

    pub fn parent_shutdown_duration(&self) -> Duration {
        Duration::from_secs(self.parent_shutdown_duration_secs)
    }
}
