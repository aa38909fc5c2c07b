use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deck::Deck;

/// Tunables for the terminal engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Replay buffer cap per session, in bytes.
    pub buffer_limit: usize,
    /// A session with no viewers is reclaimed once idle this long.
    pub idle_timeout_secs: u64,
    /// How often the idle reaper runs.
    pub reap_interval_secs: u64,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_messages: u32,
    pub max_sessions: usize,
    pub max_viewers_per_session: usize,
    /// Outbound frames queued per viewer before it is considered too slow.
    pub viewer_queue: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Shell override; resolved from the host when unset.
    pub shell: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_limit: 50_000,
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 60,
            rate_limit_window_ms: 1_000,
            rate_limit_max_messages: 100,
            max_sessions: 256,
            max_viewers_per_session: 64,
            viewer_queue: 1024,
            default_cols: 120,
            default_rows: 32,
            shell: None,
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub engine: EngineConfig,
    pub auth: AuthConfig,
    /// Directory for persisted session records. Persistence is off when unset.
    pub state_dir: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub decks: Vec<Deck>,
}

impl ServerConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.user.is_some() != self.auth.password.is_some() {
            return Err(ConfigError::Invalid(
                "auth.user and auth.password must be set together".into(),
            ));
        }
        if self.engine.rate_limit_max_messages == 0 {
            return Err(ConfigError::Invalid(
                "engine.rate_limit_max_messages must be at least 1".into(),
            ));
        }
        if self.engine.viewer_queue == 0 {
            return Err(ConfigError::Invalid("engine.viewer_queue must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for deck in &self.decks {
            if !seen.insert(deck.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate deck id: {}", deck.id)));
            }
        }
        Ok(())
    }

    /// Basic-auth credentials when both halves are configured.
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.auth.user, &self.auth.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

/// Default location of the config file (`$XDG_CONFIG_HOME/deckterm/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("deckterm").join("config.toml"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Warn when the config file is world-readable; it may hold credentials.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); \
             it may contain credentials, consider chmod 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
