use anyhow::{Context, Result};
use common::logs::{LogKind, LogPolicy, DEFAULT_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names tried, in order, for the AFD_CONFIG file under `etc/`.
pub const CONFIG_NAMES: [&str; 3] = ["AFD_CONFIG.toml", "AFD_CONFIG.yaml", "AFD_CONFIG.yml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmgConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_workers")]
    pub dir_check_workers: u32,
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default = "default_max_copied_files")]
    pub max_copied_files: u32,
    #[serde(default = "default_max_copied_file_size")]
    pub max_copied_file_size: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    #[serde(default = "default_disk_full_rescan_time")]
    pub disk_full_rescan_time: u64,
    #[serde(default = "default_max_enospc_retries")]
    pub max_enospc_retries: u32,
    #[serde(default = "default_transfer_timeout")]
    pub default_transfer_timeout: u64,
    #[serde(default)]
    pub remove_on_disabled: bool,
    /// Roots (one per filesystem) that get their own `tmp/` and `outgoing/`.
    #[serde(default)]
    pub staging_roots: Vec<PathBuf>,
}

fn default_tick_interval() -> u64 { 1000 }
fn default_workers() -> u32 { 1 }
fn default_max_errors() -> u32 { 10 }
fn default_max_copied_files() -> u32 { 100 }
fn default_max_copied_file_size() -> u64 { 100 * 1024 * 1024 }
fn default_scan_interval() -> u64 { 60 }
fn default_disk_full_rescan_time() -> u64 { 5 }
fn default_max_enospc_retries() -> u32 { 12 }
fn default_transfer_timeout() -> u64 { 120 }

impl Default for AmgConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            dir_check_workers: default_workers(),
            max_errors: default_max_errors(),
            max_copied_files: default_max_copied_files(),
            max_copied_file_size: default_max_copied_file_size(),
            scan_interval: default_scan_interval(),
            disk_full_rescan_time: default_disk_full_rescan_time(),
            max_enospc_retries: default_max_enospc_retries(),
            default_transfer_timeout: default_transfer_timeout(),
            remove_on_disabled: false,
            staging_roots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Field separator of the lineage logs; a single ASCII character.
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    #[serde(default = "default_log_files")]
    pub input_log_files: u32,
    #[serde(default = "default_log_files")]
    pub distribution_log_files: u32,
    #[serde(default = "default_log_files")]
    pub production_log_files: u32,
    #[serde(default = "default_log_files")]
    pub output_log_files: u32,
    #[serde(default = "default_log_files")]
    pub delete_log_files: u32,
    #[serde(default = "default_log_files")]
    pub event_log_files: u32,
}

fn default_log_level() -> String { "info".to_string() }
fn default_separator() -> String { (DEFAULT_SEPARATOR as char).to_string() }
fn default_max_log_size() -> u64 { 10 * 1024 * 1024 }
fn default_log_files() -> u32 { 7 }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            separator: default_separator(),
            max_log_size: default_max_log_size(),
            input_log_files: default_log_files(),
            distribution_log_files: default_log_files(),
            production_log_files: default_log_files(),
            output_log_files: default_log_files(),
            delete_log_files: default_log_files(),
            event_log_files: default_log_files(),
        }
    }
}

impl LoggingConfig {
    /// Default level of the system log; `AMG_LOG` overrides it.
    pub fn level_filter(&self) -> Result<log::LevelFilter> {
        self.level
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown log level {:?}", self.level))
    }

    pub fn separator_byte(&self) -> Result<u8> {
        match self.separator.as_bytes() {
            [b] if b.is_ascii() && !b.is_ascii_alphanumeric() && *b != b' ' && *b != b'\n' => Ok(*b),
            _ => Err(anyhow::anyhow!(
                "Log separator must be one ASCII punctuation character, got {:?}",
                self.separator
            )),
        }
    }

    pub fn policy(&self, kind: LogKind) -> LogPolicy {
        let retention = match kind {
            LogKind::Input => self.input_log_files,
            LogKind::Distribution => self.distribution_log_files,
            LogKind::Production => self.production_log_files,
            LogKind::Output => self.output_log_files,
            LogKind::Delete => self.delete_log_files,
            LogKind::Event => self.event_log_files,
        };
        LogPolicy {
            max_size: self.max_log_size,
            retention,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub error_action: Option<PathBuf>,
    pub info_action: Option<PathBuf>,
    pub warn_action: Option<PathBuf>,
    #[serde(default = "default_action_timeout")]
    pub timeout_secs: u64,
}

fn default_action_timeout() -> u64 { 30 }

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            error_action: None,
            info_action: None,
            warn_action: None,
            timeout_secs: default_action_timeout(),
        }
    }
}

impl ActionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AfdConfig {
    #[serde(default)]
    pub amg: AmgConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub actions: ActionConfig,
}

impl AfdConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AfdConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AfdConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// First AFD_CONFIG found in `etc_dir`, or the defaults when there is none.
    pub fn load(etc_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        for name in CONFIG_NAMES {
            let path = etc_dir.join(name);
            if path.exists() {
                log::info!("Using configuration {}", path.display());
                return Self::from_file(&path);
            }
        }
        log::warn!("No AFD_CONFIG in {}, using defaults", etc_dir.display());
        Ok(Self::default())
    }

    /// Merge with another config, preferring values from other
    pub fn merge(&mut self, other: AfdConfig) {
        self.amg = other.amg;
        self.logging = other.logging;
        if other.actions.error_action.is_some() {
            self.actions.error_action = other.actions.error_action;
        }
        if other.actions.info_action.is_some() {
            self.actions.info_action = other.actions.info_action;
        }
        if other.actions.warn_action.is_some() {
            self.actions.warn_action = other.actions.warn_action;
        }
        self.actions.timeout_secs = other.actions.timeout_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AFD_CONFIG.toml");
        fs::write(&path, "").unwrap();
        let config = AfdConfig::from_file(&path).unwrap();
        assert_eq!(config.amg.max_copied_files, 100);
        assert_eq!(config.amg.max_copied_file_size, 100 * 1024 * 1024);
        assert_eq!(config.amg.disk_full_rescan_time, 5);
        assert_eq!(config.logging.separator_byte().unwrap(), b'|');
    }

    #[test]
    fn test_yaml_overrides_and_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AFD_CONFIG.yaml");
        fs::write(
            &path,
            "amg:\n  dir_check_workers: 3\nlogging:\n  separator: \";\"\n  delete_log_files: 2\n  max_log_size: 1000\nactions:\n  error_action: /usr/local/bin/on_error\n",
        )
        .unwrap();
        let config = AfdConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.amg.dir_check_workers, 3);
        assert_eq!(config.logging.separator_byte().unwrap(), b';');
        assert_eq!(
            config.logging.policy(LogKind::Delete),
            LogPolicy { max_size: 1000, retention: 2 }
        );
        assert!(config.actions.error_action.is_some());
    }

    #[test]
    fn test_bad_separator_and_extension() {
        let mut logging = LoggingConfig::default();
        logging.separator = "ab".to_string();
        assert!(logging.separator_byte().is_err());
        assert_eq!(logging.level_filter().unwrap(), log::LevelFilter::Info);
        logging.level = "Debug".to_string();
        assert_eq!(logging.level_filter().unwrap(), log::LevelFilter::Debug);
        logging.level = "loud".to_string();
        assert!(logging.level_filter().is_err());
        assert!(AfdConfig::from_file(Path::new("/tmp/AFD_CONFIG.ini")).is_err());
    }

    #[test]
    fn test_merge_keeps_unset_actions() {
        let mut base = AfdConfig::default();
        base.actions.warn_action = Some(PathBuf::from("/bin/warn"));
        let mut other = AfdConfig::default();
        other.amg.dir_check_workers = 4;
        base.merge(other);
        assert_eq!(base.amg.dir_check_workers, 4);
        assert_eq!(base.actions.warn_action, Some(PathBuf::from("/bin/warn")));
    }
}
