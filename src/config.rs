//! Configuration loading for cc-bridge.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::message::{AGENT_A, AGENT_B, BROADCAST, HUMAN};
use crate::error::{Error, Result};

/// Settings filename inside the data directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Get the default data directory (~/.cc-bridge).
pub fn default_data_dir() -> PathBuf {
    match directories::UserDirs::new() {
        Some(dirs) => dirs.home_dir().join(".cc-bridge"),
        None => std::env::temp_dir().join("cc-bridge"),
    }
}

/// Per-agent queue directories live here.
pub fn queues_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("queues")
}

/// The session snapshot lives here.
pub fn sessions_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("sessions")
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Executor configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ExecutorConfig {
    pub cli_path: String,
    pub max_turns: u32,
    pub timeout_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            max_turns: 1,
            timeout_secs: None,
        }
    }
}

/// Root settings structure.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    /// Agents polled by `start`, in order.
    pub agents: Vec<String>,
    pub poll_interval_ms: u64,
    pub executor: ExecutorConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agents: vec![AGENT_A.to_string(), AGENT_B.to_string()],
            poll_interval_ms: 1000,
            executor: ExecutorConfig::default(),
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Load `<data_dir>/settings.json`, falling back to defaults when absent.
pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let path = data_dir.join(SETTINGS_FILE);

    let settings = match std::fs::read_to_string(&path) {
        Ok(content) => {
            let settings: Settings = serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            tracing::debug!("Loaded settings from {}", path.display());
            settings
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => return Err(Error::storage(&path, e)),
    };

    validate_settings(&settings)?;
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.agents.is_empty() {
        return Err(Error::Config("agents must not be empty".to_string()));
    }

    let mut seen = HashSet::new();
    for agent in &settings.agents {
        if agent.trim().is_empty() {
            return Err(Error::Config("agent ids must not be blank".to_string()));
        }
        if agent == HUMAN || agent == BROADCAST {
            return Err(Error::Config(format!("'{}' is a reserved identifier", agent)));
        }
        if !seen.insert(agent.as_str()) {
            return Err(Error::Config(format!("duplicate agent '{}'", agent)));
        }
    }

    if settings.poll_interval_ms == 0 {
        return Err(Error::Config("poll_interval_ms must be positive".to_string()));
    }
    Ok(())
}

/// Parse a duration string (e.g., "500ms", "1s", "5m", "1h").
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let num_end = s
        .chars()
        .position(|c| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    let (num_str, unit) = s.split_at(num_end);
    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;

    let multiplier = match unit.trim() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60.0 * 1000.0,
        "h" => 60.0 * 60.0 * 1000.0,
        _ => return Err(format!("invalid duration unit in '{}' (use ms, s, m or h)", s)),
    };

    let millis = (num * multiplier) as u64;
    if millis == 0 {
        return Err(format!("duration '{}' must be positive", s));
    }
    Ok(Duration::from_millis(millis))
}
