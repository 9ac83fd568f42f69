use crate::error::{McpSyncError, McpSyncResult};
use mcpsync_registry::SyncTarget;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SETTINGS_FILE: &str = "settings.toml";
const MIN_HEALTH_CHECK_INTERVAL_SECS: u64 = 5;

/// Settings shared between services; writers replace the whole value.
pub type SharedSettings = Arc<RwLock<Settings>>;

/// Which side wins when a server exists both in the registry and in a
/// target file with different connection settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    PreferRegistry,
    PreferExternal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the well-known config path. `~` is expanded.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Per-probe timeout for health checks
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Write targets automatically after every registry change
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    /// Verbose logging plus the diagnostics trace file
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Ask the consuming app to restart when one of its servers starts failing
    #[serde(default)]
    pub restart_on_failure: bool,
    /// Overrides the platform location of `managed-mcp.json`
    #[serde(default)]
    pub enterprise_path: Option<String>,

    #[serde(default)]
    pub claude_desktop: TargetSettings,
    #[serde(default)]
    pub claude_code: TargetSettings,
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            auto_sync: true,
            debug_logging: false,
            merge_policy: MergePolicy::PreferRegistry,
            restart_on_failure: false,
            enterprise_path: None,
            claude_desktop: TargetSettings::default(),
            claude_code: TargetSettings::default(),
        }
    }
}

impl Settings {
    /// Get the settings file path
    pub fn settings_path() -> McpSyncResult<PathBuf> {
        let dir = mcpsync_shared::app_dir()
            .map_err(|e| McpSyncError::ConfigReadError(format!("app dir: {}", e)))?;
        Ok(dir.join(SETTINGS_FILE))
    }

    /// Load settings from the default location, falling back to defaults
    /// when the file is missing or unreadable.
    pub fn load() -> Self {
        let path = match Self::settings_path() {
            Ok(path) => path,
            Err(e) => {
                log::warn!("{}", e);
                return Self::default();
            }
        };
        Self::load_from(&path).unwrap_or_else(|e| {
            log::warn!("using default settings: {}", e);
            Self::default()
        })
    }

    /// Load settings from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> McpSyncResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| McpSyncError::ConfigReadError(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| McpSyncError::ConfigParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn save_to(&self, path: &Path) -> McpSyncResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| McpSyncError::ConfigWriteError(format!("create_dir_all: {}", e)))?;
        }
        let content = toml::to_string_pretty(self)?;
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, content)
            .map_err(|e| McpSyncError::ConfigWriteError(format!("write tmp: {}", e)))?;
        std::fs::rename(&temp_path, path)
            .map_err(|e| McpSyncError::ConfigWriteError(format!("rename: {}", e)))?;
        Ok(())
    }

    pub fn target(&self, target: SyncTarget) -> &TargetSettings {
        match target {
            SyncTarget::ClaudeDesktop => &self.claude_desktop,
            SyncTarget::ClaudeCode => &self.claude_code,
        }
    }

    pub fn target_enabled(&self, target: SyncTarget) -> bool {
        self.target(target).enabled
    }

    pub fn enabled_targets(&self) -> Vec<SyncTarget> {
        SyncTarget::ALL
            .into_iter()
            .filter(|target| self.target_enabled(*target))
            .collect()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(
            self.health_check_interval_secs
                .max(MIN_HEALTH_CHECK_INTERVAL_SECS),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }
}
