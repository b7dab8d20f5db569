use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};
use anyhow::{Result, Context};
use log::warn;

/// Main configuration structure for the command pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Command dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Per-user conversation context configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// Event bus configuration
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum meal suggestions written into a reply
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,

    /// Defuse `TAG:` sequences in text returned by collaborators
    #[serde(default = "default_neutralize_markers")]
    pub neutralize_markers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Suggestions remembered per user
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Seconds of inactivity before a user's context is dropped (0 keeps it forever)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Upper bound on users held in memory
    #[serde(default = "default_max_users")]
    pub max_users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

// Default value functions
fn default_max_suggestions() -> usize { 3 }
fn default_neutralize_markers() -> bool { true }
fn default_history_size() -> usize { 3 }
fn default_ttl_secs() -> u64 { 3600 }
fn default_max_users() -> usize { 10_000 }
fn default_event_capacity() -> usize { 100 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_suggestions: default_max_suggestions(),
            neutralize_markers: default_neutralize_markers(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            ttl_secs: default_ttl_secs(),
            max_users: default_max_users(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid configuration")
    }

    /// Load configuration from command line argument or default locations
    pub fn load(config_path: &Option<String>) -> Result<Self> {
        if let Some(path) = config_path {
            let expanded = shellexpand::tilde(path);
            return Self::from_file(expanded.as_ref());
        }

        let default_paths = [
            "nutrivize.toml",
            ".nutrivize.toml",
            "~/.config/nutrivize/config.toml",
        ];

        for path in default_paths {
            let expanded_path = shellexpand::tilde(path);
            if Path::new(expanded_path.as_ref()).exists() {
                match Self::from_file(expanded_path.as_ref()) {
                    Ok(config) => return Ok(config),
                    Err(e) => warn!("Failed to load config from {}: {:#}", path, e),
                }
            }
        }

        Ok(Self::default())
    }
}
