use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_WELLTRACK_CONFIG: &str = "WELLTRACK_CONFIG";

const DEFAULT_WORKER_BINARY: &str = "welltrack-worker";
const DEFAULT_REGENERATION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TEMPLATE_DESCRIPTION_COUNT: u32 = 4;
const DEFAULT_CACHE_STALENESS_HOURS: u64 = 24;
const LOG_FILE_NAME: &str = "welltrack.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WelltrackConfig {
    #[serde(default)]
    pub worker: WorkerConfigToml,
    #[serde(default)]
    pub cache: CacheConfigToml,
    #[serde(default)]
    pub parameters: ParametersConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfigToml {
    #[serde(default = "default_worker_binary")]
    pub binary: String,
    #[serde(default)]
    pub base_args: Vec<String>,
    #[serde(default = "default_regeneration_timeout_secs")]
    pub regeneration_timeout_secs: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_template_description_count")]
    pub template_description_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfigToml {
    #[serde(default = "default_cache_directory")]
    pub directory: String,
    #[serde(default = "default_cache_staleness_hours")]
    pub staleness_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParametersConfigToml {
    #[serde(default = "default_parameters_file")]
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRuntimeConfig {
    pub binary: PathBuf,
    pub base_args: Vec<String>,
    pub regeneration_timeout: Duration,
    pub debug: bool,
    pub template_description_count: u32,
    pub template_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRuntimeConfig {
    pub directory: PathBuf,
    pub staleness: Duration,
}

impl WelltrackConfig {
    pub fn worker_runtime(&self) -> WorkerRuntimeConfig {
        WorkerRuntimeConfig {
            binary: PathBuf::from(&self.worker.binary),
            base_args: self.worker.base_args.clone(),
            regeneration_timeout: Duration::from_secs(self.worker.regeneration_timeout_secs),
            debug: self.worker.debug,
            template_description_count: self.worker.template_description_count,
            template_path: self.worker.template_path.as_ref().map(PathBuf::from),
        }
    }

    pub fn cache_runtime(&self) -> CacheRuntimeConfig {
        CacheRuntimeConfig {
            directory: PathBuf::from(&self.cache.directory),
            staleness: Duration::from_secs(self.cache.staleness_hours.saturating_mul(60 * 60)),
        }
    }

    pub fn parameter_file_path(&self) -> PathBuf {
        PathBuf::from(&self.parameters.file)
    }

    /// Log file, placed beside the cache directory.
    pub fn log_path(&self) -> PathBuf {
        let cache_dir = PathBuf::from(&self.cache.directory);
        match cache_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(LOG_FILE_NAME),
            _ => default_welltrack_data_dir().join(LOG_FILE_NAME),
        }
    }
}

pub fn load_from_env() -> Result<WelltrackConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<WelltrackConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home.join(".config").join("welltrack").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_WELLTRACK_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "WELLTRACK_CONFIG contained invalid UTF-8",
        )),
    }
}

fn default_welltrack_data_dir() -> PathBuf {
    resolve_data_local_dir().join("welltrack")
}

fn resolve_data_local_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("LOCALAPPDATA") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join("AppData").join("Local");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = resolve_home_dir() {
            return home.join("Library").join("Application Support");
        }
    }

    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        if let Ok(path) = std::env::var("XDG_DATA_HOME") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join(".local").join("share");
        }
    }

    std::env::temp_dir()
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn absolutize_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }

    if let Ok(current) = std::env::current_dir() {
        return current.join(path);
    }

    std::env::temp_dir().join(path)
}

fn default_worker_binary() -> String {
    DEFAULT_WORKER_BINARY.to_owned()
}

fn default_regeneration_timeout_secs() -> u64 {
    DEFAULT_REGENERATION_TIMEOUT_SECS
}

fn default_template_description_count() -> u32 {
    DEFAULT_TEMPLATE_DESCRIPTION_COUNT
}

fn default_cache_directory() -> String {
    default_welltrack_data_dir()
        .join("cache")
        .to_string_lossy()
        .to_string()
}

fn default_cache_staleness_hours() -> u64 {
    DEFAULT_CACHE_STALENESS_HOURS
}

fn default_parameters_file() -> String {
    default_welltrack_data_dir()
        .join("parameters.json")
        .to_string_lossy()
        .to_string()
}

impl Default for WorkerConfigToml {
    fn default() -> Self {
        Self {
            binary: default_worker_binary(),
            base_args: Vec::new(),
            regeneration_timeout_secs: default_regeneration_timeout_secs(),
            debug: false,
            template_description_count: default_template_description_count(),
            template_path: None,
        }
    }
}

impl Default for CacheConfigToml {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            staleness_hours: default_cache_staleness_hours(),
        }
    }
}

impl Default for ParametersConfigToml {
    fn default() -> Self {
        Self {
            file: default_parameters_file(),
        }
    }
}

fn persist_config(path: &Path, config: &WelltrackConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize WELLTRACK_CONFIG for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write WELLTRACK_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<WelltrackConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for WELLTRACK_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = WelltrackConfig::default();
            persist_config(path, &default_config)?;
            return Ok(default_config);
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read WELLTRACK_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: WelltrackConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse WELLTRACK_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    if normalize_config(&mut config) {
        persist_config(path, &config)?;
    }

    Ok(config)
}

fn normalize_config(config: &mut WelltrackConfig) -> bool {
    let mut changed = false;

    changed |= normalize_non_empty_string(&mut config.worker.binary, default_worker_binary());
    changed |= normalize_string_vec(&mut config.worker.base_args);
    if config.worker.regeneration_timeout_secs == 0 {
        config.worker.regeneration_timeout_secs = 1;
        changed = true;
    }
    if config.worker.template_description_count == 0 {
        config.worker.template_description_count = default_template_description_count();
        changed = true;
    }
    if let Some(template_path) = &config.worker.template_path {
        let trimmed = template_path.trim();
        if trimmed.is_empty() {
            config.worker.template_path = None;
            changed = true;
        } else if trimmed != template_path {
            config.worker.template_path = Some(trimmed.to_owned());
            changed = true;
        }
    }

    changed |= normalize_non_empty_string(&mut config.cache.directory, default_cache_directory());
    if config.cache.staleness_hours == 0 {
        config.cache.staleness_hours = 1;
        changed = true;
    }

    changed |= normalize_non_empty_string(&mut config.parameters.file, default_parameters_file());

    changed
}

fn normalize_non_empty_string(value: &mut String, default: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != default {
            *value = default;
            return true;
        }
        return false;
    }

    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_string_vec(values: &mut Vec<String>) -> bool {
    let normalized = values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    if *values != normalized {
        *values = normalized;
        return true;
    }
    false
}
