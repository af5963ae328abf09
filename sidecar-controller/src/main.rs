#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::process::ExitCode;

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> ExitCode {
    match sidecar_controller_runtime::Args::parse_and_run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // Logging may not be initialized yet.
            eprintln!("sidecar-controller: {error:#}");
            ExitCode::FAILURE
        }
    }
}
