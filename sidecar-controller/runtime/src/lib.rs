#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use sidecar_controller_core as core;
pub use sidecar_controller_proxy as proxy;
pub use sidecar_controller_registry as registry;

mod args;
mod log;

pub use self::{args::Args, log::LogFormat};
