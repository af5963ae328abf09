//! Sidecar Controller proxy management
//!
//! The [`Watcher`] turns topology change notifications into proxy reloads:
//!
//! ```text
//! [ registry ] -> (notification) -> [ Watcher ] -> generate -> diff -> [ Agent ] -> proxy process
//! ```
//!
//! Configurations are regenerated from the full topology on every change and compared with the
//! last configuration applied. Only a configuration that differs causes the [`Agent`] to hot
//! restart the proxy. The agent writes each configuration to a file named for the restart epoch
//! it is launched with, and removes that file once the process that read it has exited.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod agent;
pub mod envoy;
mod mesh;
pub mod watcher;

pub use self::{
    agent::{Agent, Epoch, Proxy, ProxyOptions, ReloadError},
    envoy::{generate, Config, GenerateError},
    mesh::{MeshConfig, MeshConfigError},
    watcher::{
        subscribe, Notification, Notifications, ReconcileError, Reconciled, Watcher,
        DEFAULT_RELOAD_GRACE,
    },
};
