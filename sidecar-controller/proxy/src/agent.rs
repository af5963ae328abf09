use crate::Config;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::watch,
};
use tracing::{debug, info, info_span, warn, Instrument};

#[cfg(unix)]
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};

/// How long to wait for processes to be reaped after they are killed.
#[cfg(unix)]
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// A hot-restart generation of the proxy.
pub type Epoch = u32;

/// Applies configurations to a running proxy.
pub trait Agent: Send + Sync {
    /// Starts a new proxy generation with the given configuration and returns its epoch.
    ///
    /// Returns once the process has been launched; the previous generation is expected to hand
    /// over its listeners and exit on its own.
    fn reload(&self, config: &Config) -> Result<Epoch, ReloadError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("failed to write proxy configuration {}", .path.display())]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct ProxyOptions {
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    pub drain_duration: Duration,
    pub parent_shutdown_duration: Duration,
    pub service_cluster: String,
}

/// Manages proxy processes with the epoch-based hot-restart protocol.
///
/// Each reload writes the configuration to a file named for the next epoch and launches the proxy
/// binary with that epoch. The epoch only advances when the launch succeeds. Every launched
/// process is reaped by a background task that removes its configuration file once it exits.
#[derive(Clone)]
pub struct Proxy {
    options: Arc<ProxyOptions>,
    state: Arc<Mutex<State>>,
    live_tx: Arc<watch::Sender<BTreeSet<Epoch>>>,
}

#[derive(Debug, Default)]
struct State {
    epoch: Epoch,
    processes: BTreeMap<Epoch, Process>,
}

#[derive(Debug)]
struct Process {
    pid: Option<u32>,
    config: PathBuf,
}

// === impl ProxyOptions ===

impl ProxyOptions {
    pub fn config_path(&self, epoch: Epoch) -> PathBuf {
        self.config_dir.join(format!("envoy-rev{epoch}.json"))
    }

    fn command(&self, config: &Path, epoch: Epoch) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg(config)
            .arg("--restart-epoch")
            .arg(epoch.to_string())
            .arg("--drain-time-s")
            .arg(self.drain_duration.as_secs().to_string())
            .arg("--parent-shutdown-time-s")
            .arg(self.parent_shutdown_duration.as_secs().to_string())
            .arg("--service-cluster")
            .arg(&self.service_cluster)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }
}

// === impl Proxy ===

impl Proxy {
    pub fn new(options: ProxyOptions) -> Self {
        let (live_tx, _) = watch::channel(BTreeSet::new());
        Self {
            options: Arc::new(options),
            state: Default::default(),
            live_tx: Arc::new(live_tx),
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// The epoch that the next successful reload will be launched with.
    pub fn epoch(&self) -> Epoch {
        self.state.lock().epoch
    }

    /// Returns the process id of each generation that has not yet been reaped.
    pub fn live(&self) -> BTreeMap<Epoch, Option<u32>> {
        self.state
            .lock()
            .processes
            .iter()
            .map(|(epoch, p)| (*epoch, p.pid))
            .collect()
    }

    /// Watches the set of generations that have not yet been reaped.
    pub fn watch_live(&self) -> watch::Receiver<BTreeSet<Epoch>> {
        self.live_tx.subscribe()
    }

    fn publish(&self, state: &State) {
        self.live_tx
            .send_replace(state.processes.keys().copied().collect());
    }

    /// Terminates every live generation and waits for each to be reaped.
    ///
    /// Processes that have not exited within `timeout` of SIGTERM are killed.
    #[cfg(unix)]
    pub async fn shutdown(&self, timeout: Duration) {
        if self.live().is_empty() {
            return;
        }

        self.signal_all(Signal::SIGTERM);
        if self.wait_reaped(timeout).await {
            info!("Proxy processes stopped");
            return;
        }

        warn!(?timeout, "Proxy processes did not stop; sending SIGKILL");
        self.signal_all(Signal::SIGKILL);
        if !self.wait_reaped(KILL_TIMEOUT).await {
            warn!(live = ?self.live(), "Proxy processes still running after SIGKILL");
        }
    }

    #[cfg(unix)]
    fn signal_all(&self, sig: Signal) {
        let state = self.state.lock();
        for (epoch, process) in &state.processes {
            let Some(pid) = process.pid else { continue };
            match signal::kill(Pid::from_raw(pid as i32), sig) {
                Ok(()) => debug!(epoch, pid, signal = ?sig, "Signaled proxy"),
                // Exited but not yet reaped.
                Err(nix::errno::Errno::ESRCH) => {}
                Err(error) => warn!(epoch, pid, signal = ?sig, %error, "Failed to signal proxy"),
            }
        }
    }

    /// Waits up to `timeout` for every process to be reaped.
    #[cfg(unix)]
    async fn wait_reaped(&self, timeout: Duration) -> bool {
        let mut live = self.watch_live();
        let reaped = matches!(
            tokio::time::timeout(timeout, live.wait_for(|epochs| epochs.is_empty())).await,
            Ok(Ok(_))
        );
        reaped
    }

    async fn reap(self, epoch: Epoch, mut child: Child) {
        match child.wait().await {
            Ok(status) if status.success() => info!(%status, "Proxy exited"),
            Ok(status) => warn!(%status, "Proxy exited with failure"),
            Err(error) => warn!(%error, "Failed to wait for proxy"),
        }

        // The record is removed only after its file.
        let config = self
            .state
            .lock()
            .processes
            .get(&epoch)
            .map(|p| p.config.clone());
        if let Some(config) = config {
            match tokio::fs::remove_file(&config).await {
                Ok(()) => debug!(path = %config.display(), "Removed proxy configuration"),
                Err(error) => {
                    warn!(path = %config.display(), %error, "Failed to remove proxy configuration")
                }
            }
        }

        let mut state = self.state.lock();
        state.processes.remove(&epoch);
        self.publish(&state);
    }
}

impl Agent for Proxy {
    fn reload(&self, config: &Config) -> Result<Epoch, ReloadError> {
        let mut state = self.state.lock();
        let epoch = state.epoch;

        // Configurations are small. They are written while the epoch is held so that no other
        // reload can launch a process with this epoch before its file is complete.
        let path = self.options.config_path(epoch);
        config
            .write_file(&path)
            .map_err(|source| ReloadError::WriteConfig {
                path: path.clone(),
                source,
            })?;

        let child = match self.options.command(&path, epoch).spawn() {
            Ok(child) => child,
            Err(source) => {
                if let Err(error) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), %error, "Failed to remove proxy configuration");
                }
                return Err(ReloadError::Spawn {
                    binary: self.options.binary.clone(),
                    source,
                });
            }
        };
        let pid = child.id();
        info!(epoch, pid = ?pid, path = %path.display(), "Launched proxy");

        state.processes.insert(epoch, Process { pid, config: path });
        state.epoch += 1;
        self.publish(&state);
        drop(state);

        tokio::spawn(
            self.clone()
                .reap(epoch, child)
                .instrument(info_span!("proxy", epoch)),
        );
        Ok(epoch)
    }
}

impl<A: Agent + ?Sized> Agent for Arc<A> {
    fn reload(&self, config: &Config) -> Result<Epoch, ReloadError> {
        (**self).reload(config)
    }
}

#[cfg(all(test, unix))]
mod tests;
