//! Publisher configuration
//!
//! Settings come from an optional TOML file; command line flags are applied
//! on top by the binary.

mod schema;

pub use schema::*;

use std::path::Path;
use tracing::info;

use crate::error::{AppError, Result};

/// Parse a configuration from TOML text
pub fn from_toml_str(text: &str) -> Result<PublishConfig> {
    toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))
}

/// Load a configuration file
pub async fn load(path: &Path) -> Result<PublishConfig> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config = from_toml_str(&text)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
