//! Process-wide settings
//!
//! Loaded from an optional TOML file, then overridden by `WGSYNC_*`
//! environment variables, then by command-line flags.
//!
//! ```toml
//! endpoint = "vpn.example.com"
//! store_private_keys = false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Environment variable overriding [`Settings::endpoint`]
pub const ENV_ENDPOINT: &str = "WGSYNC_ENDPOINT";

/// Environment variable overriding [`Settings::store_private_keys`]
pub const ENV_STORE_PRIVATE_KEYS: &str = "WGSYNC_STORE_PRIVATE_KEYS";

/// Settings shared by the engine, the renderer and the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Hostname peers use to reach the interfaces
    pub endpoint: String,
    /// Whether peer private keys are kept in the record store
    pub store_private_keys: bool,
    /// Path to the `wg` tool
    pub wg_path: String,
    /// Path to the `ip` tool
    pub ip_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: "localhost".to_string(),
            store_private_keys: true,
            wg_path: "wg".to_string(),
            ip_path: "ip".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SettingsError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                SettingsError::Io(e)
            }
        })?;

        toml::from_str(&content).map_err(|e| SettingsError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Apply `WGSYNC_*` overrides from the process environment
    pub fn with_env(self) -> Result<Self, SettingsError> {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    fn with_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }

        if let Some(value) = lookup(ENV_STORE_PRIVATE_KEYS) {
            self.store_private_keys = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(SettingsError::InvalidEnv {
                        variable: ENV_STORE_PRIVATE_KEYS.to_string(),
                        value,
                    })
                }
            };
        }

        Ok(self)
    }
}
