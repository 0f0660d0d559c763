//! Broker configuration.
//!
//! One TOML file with a section per component. Every section is
//! `#[serde(default)]`, so a missing file or an empty table yields defaults.
//! Resolution order: CLI `--config`, then `SHELLHOST_CONFIG`, then
//! `<config dir>/shellhost/shellhost.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::boot::BootConfig;
use crate::buffer::BufferConfig;
use crate::error::{ConfigError, Result};
use crate::instance_cache::CacheConfig;
use crate::ipc::IpcConfig;
use crate::logging::{LogConfig, LogLevel};
use crate::memory_pressure::MemoryConfig;
use crate::supervisor::SupervisorConfig;
use crate::watchdog::WatchdogConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "SHELLHOST_CONFIG";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable colored output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("invalid log format: {s} (expected pretty or json)")),
        }
    }
}

/// Complete broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub logging: LogConfig,
    pub supervisor: SupervisorConfig,
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub watchdog: WatchdogConfig,
    pub boot: BootConfig,
    pub buffers: BufferConfig,
    pub ipc: IpcConfig,
}

/// `<config dir>/shellhost/shellhost.toml`, if a config dir is known.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shellhost").join("shellhost.toml"))
}

/// Pick the config file: explicit path, then the environment, then the default.
#[must_use]
pub fn resolve_path(cli: Option<PathBuf>) -> Option<PathBuf> {
    cli.or_else(|| {
        std::env::var_os(CONFIG_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
    .or_else(default_config_path)
}

impl BrokerConfig {
    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                }
                .into());
            }
        };
        Self::from_toml_str(&text)
    }

    /// Load the resolved config file, or defaults when none applies.
    pub fn load_resolved(cli: Option<PathBuf>) -> Result<Self> {
        match resolve_path(cli) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Reject inverted thresholds and zero intervals.
    pub fn validate(&self) -> Result<()> {
        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(|e| invalid(format!("logging.level: {e}")))?;

        let m = &self.memory;
        nonzero("memory.sample_interval_ms", m.sample_interval_ms)?;
        if !(m.self_medium_mb < m.self_low_mb && m.self_low_mb < m.self_critical_mb) {
            return Err(invalid(format!(
                "memory self thresholds must ascend: medium {} < low {} < critical {}",
                m.self_medium_mb, m.self_low_mb, m.self_critical_mb
            )));
        }
        let percents = [
            m.normal_used_percent,
            m.low_used_percent,
            m.critical_used_percent,
            m.reboot_used_percent,
        ];
        if percents.iter().any(|p| !(*p > 0.0 && *p <= 100.0))
            || percents.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(invalid(format!(
                "memory used-percent crossings must ascend within (0, 100]: {percents:?}"
            )));
        }
        if let Some(table) = &m.static_thresholds {
            let limits = [
                table.normal.limit_mb,
                table.low.limit_mb,
                table.critical.limit_mb,
                table.reboot.limit_mb,
            ];
            if limits.windows(2).any(|w| w[0] > w[1]) {
                return Err(invalid(format!(
                    "memory.static_thresholds limits must not descend: {limits:?}"
                )));
            }
        }

        nonzero("supervisor.max_processes", self.supervisor.max_processes as u64)?;
        nonzero("supervisor.nuke_debounce_ms", self.supervisor.nuke_debounce_ms)?;
        nonzero("watchdog.check_interval_ms", self.watchdog.check_interval_ms)?;
        nonzero("watchdog.headless_timeout_ms", self.watchdog.headless_timeout_ms)?;
        nonzero("boot.idle_spacing_ms", self.boot.idle_spacing_ms)?;
        nonzero(
            "boot.idle_callbacks_required",
            u64::from(self.boot.idle_callbacks_required),
        )?;
        nonzero("boot.launcher_timeout_ms", self.boot.launcher_timeout_ms)?;
        nonzero("buffers.resize_timeout_ms", self.buffers.resize_timeout_ms)?;
        nonzero("buffers.max_dimension", u64::from(self.buffers.max_dimension))?;
        nonzero("ipc.max_line_bytes", self.ipc.max_line_bytes as u64)?;
        Ok(())
    }
}

fn invalid(message: String) -> crate::Error {
    ConfigError::ValidationError(message).into()
}

fn nonzero(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(invalid(format!("{name} must be greater than zero")));
    }
    Ok(())
}
