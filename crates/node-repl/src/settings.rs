//! Persistent settings for node-repl.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/node-repl/settings.json
//! - Linux: ~/.config/node-repl/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\node-repl\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::backend::{SessionConfig, DEFAULT_EVAL_TIMEOUT, DEFAULT_STARTUP_TIMEOUT};

fn default_eval_timeout_secs() -> u64 {
    DEFAULT_EVAL_TIMEOUT.as_secs()
}

fn default_startup_timeout_secs() -> u64 {
    DEFAULT_STARTUP_TIMEOUT.as_secs()
}

/// User-configurable settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplSettings {
    /// Explicit node binary; falls back to `$NODE_REPL_NODE`, then `PATH`
    #[serde(default)]
    pub node_path: Option<PathBuf>,

    /// Extra arguments passed to node before the bootstrap script
    #[serde(default)]
    pub node_args: Vec<String>,

    /// Per-cell evaluation timeout
    #[serde(default = "default_eval_timeout_secs")]
    pub eval_timeout_secs: u64,

    /// How long node may take to start
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl Default for ReplSettings {
    fn default() -> Self {
        Self {
            node_path: None,
            node_args: Vec::new(),
            eval_timeout_secs: default_eval_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

impl ReplSettings {
    /// Build a session config for the resolved node binary.
    pub fn session_config(&self, node_path: impl Into<PathBuf>) -> SessionConfig {
        SessionConfig {
            node_path: node_path.into(),
            node_args: self.node_args.clone(),
            eval_timeout: Duration::from_secs(self.eval_timeout_secs.max(1)),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs.max(1)),
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    crate::default_config_dir().join("settings.json")
}

/// Load settings from `path`, returning defaults if it is missing or invalid
pub fn load_settings_from(path: &Path) -> ReplSettings {
    if !path.exists() {
        return ReplSettings::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("[settings] Failed to read {}: {}", path.display(), e);
            return ReplSettings::default();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("[settings] Failed to parse {}: {}", path.display(), e);
            ReplSettings::default()
        }
    }
}

/// Load settings from the default location
pub fn load_settings() -> ReplSettings {
    load_settings_from(&settings_path())
}

/// Save settings to `path`
pub fn save_settings_to(settings: &ReplSettings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, format!("{json}\n"))?;
    info!("[settings] Saved settings to {}", path.display());
    Ok(())
}

/// Save settings to the default location
pub fn save_settings(settings: &ReplSettings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}
