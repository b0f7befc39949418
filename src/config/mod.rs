//! Configuration management for deferred-map
//!
//! The defaults are compile-time constants and are what a plain
//! `LD_PRELOAD=libdeferred_map.so xterm` gets. A TOML file named by
//! `DEFERRED_MAP_CONFIG` may override any of them; a broken file is
//! reported and ignored rather than stopping the host program.

use crate::error::DeferError;
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;


/// Seconds a parked process waits for release before giving up (6 hours)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 6 * 3600;

/// Name a parked process advertises, so `pkill -USR1 xtermserver` finds it
pub const DEFAULT_SERVER_NAME: &str = "xtermserver";

/// Environment variable naming an optional override file
pub const CONFIG_ENV: &str = "DEFERRED_MAP_CONFIG";

/// Longest name `PR_SET_NAME` keeps (TASK_COMM_LEN minus the NUL)
pub const MAX_PROCESS_NAME_LEN: usize = 15;

/// Settings for the deferral layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeferConfig {
    /// Idle timeout in seconds; 0 waits forever
    pub idle_timeout_secs: u32,

    /// Process name advertised while a window is parked
    pub server_name: String,

    /// Ask the window manager to raise and focus the window once mapped
    pub activate_window: bool,

    /// Detach from the invoking terminal after release
    pub detach_on_release: bool,
}

impl Default for DeferConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            activate_window: true,
            detach_on_release: true,
        }
    }
}

impl DeferConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            let rest = path.strip_prefix("~").unwrap_or(path);
            Path::new(&home).join(rest)
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: DeferConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Resolve the effective configuration for this process
    ///
    /// Never fails: without `DEFERRED_MAP_CONFIG` the defaults apply, and a
    /// file that cannot be used is logged before falling back to them.
    pub fn from_env() -> Self {
        let Some(path) = std::env::var_os(CONFIG_ENV) else {
            return Self::default();
        };

        match Self::load(&path) {
            Ok(config) => {
                debug!("📄 Loaded configuration from {}", Path::new(&path).display());
                config
            }
            Err(e) => {
                warn!("⚠️ Ignoring {}: {:#}", CONFIG_ENV, e);
                Self::default()
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), DeferError> {
        let name = &self.server_name;

        if name.is_empty() {
            return Err(DeferError::InvalidConfig(
                "server_name must not be empty".to_string(),
            ));
        }

        if name.len() > MAX_PROCESS_NAME_LEN {
            return Err(DeferError::InvalidConfig(format!(
                "server_name {:?} is longer than {} bytes",
                name, MAX_PROCESS_NAME_LEN
            )));
        }

        if name.contains('\0') {
            return Err(DeferError::InvalidConfig(
                "server_name must not contain NUL".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the idle timeout is armed at all
    pub fn timeout_enabled(&self) -> bool {
        self.idle_timeout_secs != 0
    }
}
