use crate::{
    proxy::{subscribe, MeshConfig, Proxy, ProxyOptions, Watcher},
    registry::{Aggregate, FileRegistry, Platform},
    LogFormat,
};
use anyhow::{Context, Result};
use clap::Parser;
use sidecar_controller_core::Controller;
use std::{path::PathBuf, sync::Arc};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::Duration,
};
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "sidecar-controller",
    about = "Keeps a sidecar proxy configured for the service mesh topology"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "sidecar_controller=info,warn",
        env = "SIDECAR_CONTROLLER_LOG"
    )]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    /// The proxy binary launched on every reload.
    #[clap(long, default_value = "/usr/local/bin/envoy")]
    proxy_binary: PathBuf,

    /// The directory in which per-epoch proxy configurations are written.
    #[clap(long, default_value = "/etc/envoy")]
    config_dir: PathBuf,

    /// A JSON file with mesh-wide proxy settings.
    #[clap(long)]
    mesh_config: Option<PathBuf>,

    /// A JSON service catalog. May be repeated; earlier files take precedence.
    #[clap(long = "registry-file")]
    registry_files: Vec<PathBuf>,

    #[clap(long, default_value = "1000")]
    registry_poll_interval_ms: u64,

    #[clap(long, default_value = "256")]
    reload_grace_ms: u64,

    /// How long proxy processes are given to exit on shutdown before they are killed.
    #[clap(long, default_value = "10000")]
    proxy_stop_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            proxy_binary,
            config_dir,
            mesh_config,
            registry_files,
            registry_poll_interval_ms,
            reload_grace_ms,
            proxy_stop_timeout_ms,
        } = self;

        let filter = EnvFilter::try_new(&log_level)
            .with_context(|| format!("invalid log level: {log_level}"))?;
        log_format.try_init(filter)?;
        info!(version = env!("CARGO_PKG_VERSION"), "Starting sidecar-controller");

        tokio::fs::create_dir_all(&config_dir)
            .await
            .with_context(|| format!("failed to create {}", config_dir.display()))?;

        let mesh = match mesh_config {
            Some(path) => MeshConfig::read(&path).await?,
            None => MeshConfig::default(),
        };
        let mesh = Arc::new(mesh);

        let aggregate = Arc::new(
            load_registries(
                &registry_files,
                Duration::from_millis(registry_poll_interval_ms),
            )
            .await?,
        );

        let proxy = Proxy::new(ProxyOptions {
            binary: proxy_binary,
            config_dir,
            drain_duration: mesh.drain_duration(),
            parent_shutdown_duration: mesh.parent_shutdown_duration(),
            service_cluster: mesh.service_cluster.clone(),
        });
        let watcher = Watcher::new(proxy.clone(), aggregate.clone(), mesh)
            .with_grace(Duration::from_millis(reload_grace_ms));
        let notifications =
            subscribe(&*aggregate).context("failed to subscribe to service changes")?;

        let (signal, shutdown) = drain::channel();
        tokio::spawn(
            watcher
                .run(notifications, shutdown.clone())
                .instrument(info_span!("watcher")),
        );
        tokio::spawn(async move { aggregate.run(shutdown).await });

        let signame = shutdown_signal().await?;
        info!(signal = signame, "Shutting down");
        signal.drain().await;

        // Reapers only run while the runtime does.
        proxy
            .shutdown(Duration::from_millis(proxy_stop_timeout_ms))
            .await;
        Ok(())
    }
}

async fn load_registries(paths: &[PathBuf], interval: Duration) -> Result<Aggregate> {
    let mut aggregate = Aggregate::new();
    if paths.is_empty() {
        warn!("No registries configured");
    }
    for (i, path) in paths.iter().enumerate() {
        let registry = FileRegistry::load(path, interval).await?;
        let platform = if paths.len() == 1 {
            Platform::FILE
        } else {
            Platform::new(format!("file-{i}"))
        };
        aggregate.add_adapter(platform, Arc::new(registry));
    }
    Ok(aggregate)
}

async fn shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signame = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signame)
}
