use crate::{envoy, Agent, Config, Epoch, GenerateError, MeshConfig, ReloadError};
use anyhow::Result;
use sidecar_controller_core::{Controller, Event, Service, ServiceDiscovery};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tracing::{debug, info, warn};

/// How long to wait after a reload before reconciling again.
pub const DEFAULT_RELOAD_GRACE: Duration = Duration::from_millis(256);

/// A service change observed by a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub hostname: String,
    pub event: Event,
}

pub type Notifications = mpsc::UnboundedReceiver<Notification>;

/// Reconciles the proxy with the topology known to service discovery.
///
/// Each reconciliation regenerates the configuration from every known service and reloads the
/// proxy only when the result differs from the configuration last applied. Reconciliations are
/// driven by a single task, so the last-applied configuration is never compared or updated
/// concurrently.
pub struct Watcher<A> {
    agent: A,
    discovery: Arc<dyn ServiceDiscovery>,
    mesh: Arc<MeshConfig>,
    current: Option<Config>,
    grace: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    Reloaded(Epoch),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to generate proxy configuration")]
    Generate(#[source] GenerateError),

    #[error("failed to reload proxy")]
    Reload(#[source] ReloadError),
}

/// Registers a service handler that queues a notification for every service change.
///
/// The handler never blocks the registry delivering the change.
pub fn subscribe(controller: &dyn Controller) -> Result<Notifications> {
    let (tx, rx) = mpsc::unbounded_channel();
    controller.append_service_handler(Arc::new(move |svc: &Service, event: Event| {
        let _ = tx.send(Notification {
            hostname: svc.hostname(),
            event,
        });
    }))?;
    Ok(rx)
}

// === impl Watcher ===

impl<A: Agent> Watcher<A> {
    pub fn new(agent: A, discovery: Arc<dyn ServiceDiscovery>, mesh: Arc<MeshConfig>) -> Self {
        Self {
            agent,
            discovery,
            mesh,
            current: None,
            grace: DEFAULT_RELOAD_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The configuration most recently applied to the proxy.
    pub fn current(&self) -> Option<&Config> {
        self.current.as_ref()
    }

    /// Generates a configuration for the current topology and reloads the proxy if it changed.
    ///
    /// The last-applied configuration is only updated when the reload succeeds, so a failed
    /// reload is retried by the next reconciliation.
    pub fn reconcile(&mut self) -> Result<Reconciled, ReconcileError> {
        let services = self.discovery.services();
        let config = envoy::generate(&services, &self.mesh).map_err(ReconcileError::Generate)?;
        if self.current.as_ref() == Some(&config) {
            debug!(services = services.len(), "Proxy configuration unchanged");
            return Ok(Reconciled::Unchanged);
        }

        let epoch = self
            .agent
            .reload(&config)
            .map_err(ReconcileError::Reload)?;
        info!(epoch, services = services.len(), "Reloaded proxy");
        self.current = Some(config);
        Ok(Reconciled::Reloaded(epoch))
    }

    /// Reconciles once at startup and then on every notification until shutdown is signaled or
    /// every registry handler has been dropped.
    pub async fn run(mut self, mut notifications: Notifications, shutdown: drain::Watch) {
        tokio::pin! {
            let signaled = shutdown.signaled();
        }

        loop {
            if let Reconciled::Reloaded(_) = self.reconcile_logged() {
                tokio::select! {
                    biased;
                    _ = &mut signaled => break,
                    _ = time::sleep(self.grace) => {}
                }
            }

            let notification = tokio::select! {
                biased;
                _ = &mut signaled => break,
                n = notifications.recv() => match n {
                    Some(n) => n,
                    None => {
                        debug!("Notification channel closed");
                        break;
                    }
                },
            };
            debug!(hostname = %notification.hostname, event = %notification.event, "Service changed");

            // Changes queued during the last reconciliation are covered by the next one.
            let mut coalesced = 0;
            while notifications.try_recv().is_ok() {
                coalesced += 1;
            }
            if coalesced > 0 {
                debug!(coalesced, "Coalesced queued notifications");
            }
        }
        debug!("Watcher terminated");
    }

    fn reconcile_logged(&mut self) -> Reconciled {
        match self.reconcile() {
            Ok(reconciled) => reconciled,
            Err(error) => {
                let error = anyhow::Error::from(error);
                warn!(error = %format_args!("{error:#}"), "Reconciliation failed");
                Reconciled::Unchanged
            }
        }
    }
}

#[cfg(test)]
mod tests;
