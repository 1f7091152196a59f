//! The four pipeline steps, one module per subcommand.

pub mod convert;
pub mod normalize;
pub mod register;
pub mod t2map;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

/// Creates `dir` and its parents if it does not exist yet.
pub fn ensure_output_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        info!("Creating output directory {}", dir.display());
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }
    Ok(())
}
