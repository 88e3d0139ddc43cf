//! Loading the environment manifest file.

use std::path::{Path, PathBuf};

use ephem_core::{validate, EnvironmentManifest, ValidationError};

pub const DEFAULT_CONFIG_PATH: &str = ".ephemeral-config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("{path} is not valid YAML: {source}")]
    Yaml { path: PathBuf, source: serde_yaml::Error },
    #[error("{path}: {source}")]
    Invalid { path: PathBuf, source: ValidationError },
}

pub fn load_manifest(path: &Path) -> Result<EnvironmentManifest, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let raw: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source })?;
    validate(&raw).map_err(|source| ConfigError::Invalid { path: path.to_path_buf(), source })
}
