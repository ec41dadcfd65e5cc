//! Configuration file management for skywatch.
//!
//! Reads/writes `~/.skywatch/config.yaml` with storage locations and engine
//! timing (flush interval, projection rebuild cadence, queue depth).

use std::path::{Path, PathBuf};

use crate::types::SkywatchError;

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// SQLite database path.
    pub db_path: String,
    /// Legacy flat-file store imported by `migrate`.
    pub legacy_path: String,
    /// Directory holding JSON backups.
    pub backup_dir: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub flush_interval_sec: f64,
    /// Rebuild the read projection from storage every N flushes.
    pub projection_rebuild_every: u32,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig {
                db_path: "data/skywatch.db".into(),
                legacy_path: "data/encounters.json".into(),
                backup_dir: "data/backups".into(),
            },
            engine: EngineConfig {
                flush_interval_sec: 3.0,
                projection_rebuild_every: 5,
                queue_capacity: 1024,
            },
        }
    }
}

/// Get the config directory path (`~/.skywatch/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".skywatch")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.skywatch/config.yaml`.
///
/// Returns default config if file doesn't exist.
pub fn load_config() -> Config {
    load_config_from(&config_file())
}

pub fn load_config_from(path: &std::path::Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(e) => {
            log::warn!("could not read {}: {e}; using defaults", path.display());
            Config::default()
        }
    }
}

/// Reject settings the engine cannot run with.
pub fn validate(config: &Config) -> Result<(), SkywatchError> {
    let engine = &config.engine;
    if !(engine.flush_interval_sec.is_finite() && engine.flush_interval_sec > 0.0) {
        return Err(SkywatchError::Config(format!(
            "engine.flush_interval_sec must be positive, got {}",
            engine.flush_interval_sec
        )));
    }
    if engine.projection_rebuild_every == 0 {
        return Err(SkywatchError::Config("engine.projection_rebuild_every must be at least 1".into()));
    }
    if engine.queue_capacity == 0 {
        return Err(SkywatchError::Config("engine.queue_capacity must be at least 1".into()));
    }
    if config.storage.db_path.trim().is_empty() {
        return Err(SkywatchError::Config("storage.db_path is empty".into()));
    }
    Ok(())
}

/// Save config to `~/.skywatch/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf, SkywatchError> {
    let path = config_file();
    save_config_to(config, &path)?;
    Ok(path)
}

/// Save config to an explicit path, creating parent directories.
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), SkywatchError> {
    validate(config)?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serialize_config(config))?;
    Ok(())
}

/// Parse the YAML subset written by `serialize_config`.
///
/// Unknown keys and unparseable values keep their defaults.
fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let (key, val) = (key.trim(), val.trim());

        if !indented {
            section = val.is_empty().then(|| key.to_string());
            continue;
        }

        match (section.as_deref(), key) {
            (Some("storage"), "db_path") => {
                if let Some(v) = parse_string_value(val) {
                    config.storage.db_path = v;
                }
            }
            (Some("storage"), "legacy_path") => {
                if let Some(v) = parse_string_value(val) {
                    config.storage.legacy_path = v;
                }
            }
            (Some("storage"), "backup_dir") => {
                if let Some(v) = parse_string_value(val) {
                    config.storage.backup_dir = v;
                }
            }
            (Some("engine"), "flush_interval_sec") => {
                if let Some(v) = val.parse::<f64>().ok().filter(|v| *v > 0.0) {
                    config.engine.flush_interval_sec = v;
                }
            }
            (Some("engine"), "projection_rebuild_every") => {
                if let Some(v) = val.parse::<u32>().ok().filter(|v| *v > 0) {
                    config.engine.projection_rebuild_every = v;
                }
            }
            (Some("engine"), "queue_capacity") => {
                if let Some(v) = val.parse::<usize>().ok().filter(|v| *v > 0) {
                    config.engine.queue_capacity = v;
                }
            }
            _ => {}
        }
    }

    config
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    if (val.starts_with('"') && val.ends_with('"') && val.len() >= 2)
        || (val.starts_with('\'') && val.ends_with('\'') && val.len() >= 2)
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

/// Serialize config to YAML-like text.
fn serialize_config(config: &Config) -> String {
    let lines = [
        "# skywatch configuration".to_string(),
        String::new(),
        "storage:".into(),
        format!("  db_path: \"{}\"", config.storage.db_path),
        format!("  legacy_path: \"{}\"", config.storage.legacy_path),
        format!("  backup_dir: \"{}\"", config.storage.backup_dir),
        String::new(),
        "engine:".into(),
        format!("  flush_interval_sec: {}", config.engine.flush_interval_sec),
        format!(
            "  projection_rebuild_every: {}",
            config.engine.projection_rebuild_every
        ),
        format!("  queue_capacity: {}", config.engine.queue_capacity),
    ];
    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
