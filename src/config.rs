//! Configuration types for the skald core.

use crate::error::{Result, SkaldError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the coordination core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkaldConfig {
    /// Message bus settings.
    pub bus: BusConfig,
    /// Skill registry settings.
    pub registry: RegistryConfig,
    /// Intent matching settings.
    pub matcher: MatcherConfig,
    /// Session state machine settings.
    pub session: SessionConfig,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Host the WebSocket bus endpoint binds to.
    pub host: String,
    /// Port the WebSocket bus endpoint binds to.
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8181,
        }
    }
}

/// Skill registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expected interval between skill heartbeats in seconds.
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed heartbeats before a skill is marked not-alive.
    pub max_missed_heartbeats: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            max_missed_heartbeats: 3,
        }
    }
}

/// Intent matcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum score for an intent match to be accepted.
    ///
    /// Scores are in \[0, 1\]. Below this value the utterance goes to the
    /// fallback chain instead.
    pub confidence_threshold: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
        }
    }
}

/// Session state machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a skill may take to answer an intent invocation (seconds).
    pub skill_response_timeout_secs: u64,
    /// How long to wait for a follow-up utterance in AwaitingFollowUp (seconds).
    pub follow_up_timeout_secs: u64,
    /// How long a delegated child skill may hold the session (seconds).
    pub delegation_timeout_secs: u64,
    /// Idle timeout after the last effect completes before the GUI reverts
    /// to the idle screen (seconds).
    pub gui_idle_timeout_secs: u64,
    /// How long to wait for a fallback skill's accept/decline reply (seconds).
    pub fallback_response_timeout_secs: u64,
    /// Dialog id spoken when no intent and no fallback handles an utterance.
    pub unknown_dialog: String,
    /// Dialog id spoken when a session is force-ended by an error or timeout.
    pub error_dialog: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            skill_response_timeout_secs: 10,
            follow_up_timeout_secs: 15,
            delegation_timeout_secs: 20,
            gui_idle_timeout_secs: 5,
            fallback_response_timeout_secs: 5,
            unknown_dialog: "cant-help-with-that".to_owned(),
            error_dialog: "something-went-wrong".to_owned(),
        }
    }
}

impl SkaldConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing sections.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| SkaldError::Config(format!("{}: {e}", path.display())))
    }

    /// Load from the default path if the file exists, otherwise defaults.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Default config file location (`~/.config/skald/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("skald").join("config.toml"))
    }

    /// Serialize and write the configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw =
            toml::to_string_pretty(self).map_err(|e| SkaldError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }
}
