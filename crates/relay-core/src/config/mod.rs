//! Configuration for the relay core
//!
//! YAML configuration with per-field defaults, environment overrides and validation.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::RelayError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig, RelayError> {
    ConfigLoader::from_file(path).await
}
