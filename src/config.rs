use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that toggles watchdog installation.
pub const WATCHDOG_ENABLED_ENV: &str = "BLOCKWATCH_WATCHDOG_ENABLED";
/// Environment variable that overrides the listening port.
pub const PORT_ENV: &str = "BLOCKWATCH_PORT";

/// Top-level configuration loaded from blockwatch.toml.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
#[derive(Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub watchdog: WatchdogConfig,
    pub fanout: FanOutConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Used both for listening and as the base URL for self-directed sub-requests.
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Extra call sites exempted from detection, on top of the reporter itself.
    pub allow: Vec<String>,
    pub self_test: bool,
    /// Report scoped polls that hold a worker at least this long. 0 disables.
    pub long_poll_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FanOutConfig {
    pub total: u32,
    pub concurrency: usize,
    pub delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
#[derive(Default)]
pub struct RuntimeConfig {
    /// 0 means one worker per core.
    pub worker_threads: usize,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow: Vec::new(),
            self_test: true,
            long_poll_ms: 50,
        }
    }
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            total: 1000,
            concurrency: 500,
            delay_ms: 100,
        }
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for `AppConfig`.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value parsed fine but is out of range.
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl AppConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: AppConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(WATCHDOG_ENABLED_ENV) {
            self.watchdog.enabled = parse_bool_property(&raw);
        }
        if let Some(raw) = lookup(PORT_ENV) {
            self.server.port = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: PORT_ENV,
                reason: format!("{raw:?} is not a port number"),
            })?;
        }
        Ok(())
    }

    /// Reject values that would make the service unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fanout.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "fanout.concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(site) = self.watchdog.allow.iter().find(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "watchdog.allow",
                reason: format!("empty call site {site:?}"),
            });
        }
        Ok(())
    }
}

/// Boolean property parsing: only a case-insensitive "true" is true.
fn parse_bool_property(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}
