//! Command implementations.

mod info;
mod run;
mod validate;

pub use info::run_info;
pub use run::run_pipeline;
pub use validate::run_validate;

use std::path::Path;

use contracts::BridgeConfig;

use crate::error::{CliError, Result};

/// Load a configuration file, reporting a missing file distinctly
pub(crate) fn load_config(path: &Path) -> Result<BridgeConfig> {
    if !path.exists() {
        return Err(CliError::config_not_found(path));
    }
    Ok(config_loader::ConfigLoader::load_from_path(path)?)
}
