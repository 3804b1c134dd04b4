//! Config loading and persistence.

mod load;
mod merge;
mod schema;

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Effect, Transience};

pub use load::{config_path, load, load_or_default, write_config};
pub use merge::{apply_env_overrides, merge_layers};
pub use schema::{
    Config, ConfigLayer, Limits, LimitsOverride, LogFormat, LoggingConfig, LoggingConfigOverride,
    OrphanSlotPolicy, RecipeConfig, RecipeConfigOverride,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("config read failed at {path:?}: {source}")]
    Read {
        path: Box<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse failed at {path:?}: {source}")]
    Parse {
        path: Box<PathBuf>,
        #[source]
        source: serde_json::Error,
    },
    #[error("config write failed at {path:?}: {source}")]
    Write {
        path: Box<PathBuf>,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Parse { .. } => Transience::Permanent,
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
