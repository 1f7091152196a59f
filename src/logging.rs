//! Global tracing subscriber.

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber on stderr. `RUST_LOG` is honoured; `verbose`
/// raises this crate to debug level.
pub fn init(verbose: bool) -> Result<()> {
    let crate_level = if verbose { "t2map_pipeline=debug" } else { "t2map_pipeline=info" };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy()
        .add_directive(crate_level.parse().context("Invalid log directive")?);

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .finish(),
    )
    .context("Could not set up global logging subscriber")
}
