//! Config file loading.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::merge::{apply_env_overrides, merge_layers};
use super::schema::{Config, ConfigLayer};
use super::ConfigError;

const CONFIG_FILE: &str = "weft.json";

/// `WEFT_CONFIG` wins; otherwise the file sits in the working directory.
pub fn config_path() -> PathBuf {
    std::env::var_os("WEFT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

/// Load the layered config: file layer (if present) then env overrides.
pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    let mut layers = Vec::new();
    if let Some(layer) = read_layer(&path)? {
        layers.push(layer);
    }
    let mut env_layer = ConfigLayer::default();
    apply_env_overrides(&mut env_layer);
    layers.push(env_layer);
    Ok(merge_layers(&layers))
}

/// Like [`load`], but a broken file degrades to defaults with a warning.
pub fn load_or_default() -> Config {
    match load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, "config load failed; using defaults");
            Config::default()
        }
    }
}

pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let bytes = serde_json::to_vec_pretty(config).map_err(|source| ConfigError::Parse {
        path: Box::new(path.to_path_buf()),
        source,
    })?;
    fs::write(path, bytes).map_err(|source| ConfigError::Write {
        path: Box::new(path.to_path_buf()),
        source,
    })
}

fn read_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: Box::new(path.to_path_buf()),
                source,
            })
        }
    };
    let layer = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: Box::new(path.to_path_buf()),
        source,
    })?;
    Ok(Some(layer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_layer(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn file_layer_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = Config::default();
        config.logging.stdout = false;
        config.limits.max_pending_entries = 16;
        write_config(&path, &config).unwrap();

        let layer = read_layer(&path).unwrap().unwrap();
        let loaded = merge_layers(&[layer]);
        assert!(!loaded.logging.stdout);
        assert_eq!(loaded.limits.max_pending_entries, 16);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            read_layer(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}
