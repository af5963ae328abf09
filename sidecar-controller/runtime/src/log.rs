use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

// === impl LogFormat ===

impl LogFormat {
    /// Installs the global subscriber.
    pub fn try_init(self, filter: EnvFilter) -> Result<()> {
        let registry = tracing_subscriber::registry().with(filter);
        match self {
            Self::Plain => registry.with(fmt::layer()).try_init()?,
            Self::Json => registry
                .with(fmt::layer().json().with_current_span(true))
                .try_init()?,
        }
        Ok(())
    }
}
