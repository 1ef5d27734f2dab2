//! Broker configuration.
//!
//! Layered the usual way: compiled defaults, then the TOML config file,
//! then environment variables (`FERROBUS_*`), then CLI flags (applied by
//! `main`). Each layer overrides the previous.

use ferrobus_core::UserLimits;
use ferrobus_policy::PolicyConfig;
use ferrobus_types::ErrorCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "CONFIG_IO",
            Self::Parse { .. } => "CONFIG_PARSE",
        }
    }
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// The full broker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listening socket path. Falls back to `$XDG_RUNTIME_DIR/ferrobus.sock`
    /// or `/tmp/ferrobus-<uid>.sock` when unset.
    pub socket: Option<PathBuf>,
    /// Per-uid resource limits.
    pub limits: UserLimits,
    /// Access-control ruleset.
    pub policy: PolicyConfig,
}

impl BrokerConfig {
    /// Loads a config file and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_owned(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_owned(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(socket) = std::env::var("FERROBUS_SOCKET") {
            if !socket.is_empty() {
                self.socket = Some(PathBuf::from(socket));
            }
        }
    }

    /// The socket path after fallbacks.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket {
            return path.clone();
        }
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            if !runtime_dir.is_empty() {
                return PathBuf::from(runtime_dir).join("ferrobus.sock");
            }
        }
        std::env::temp_dir().join(format!("ferrobus-{}.sock", nix::unistd::Uid::current()))
    }
}
