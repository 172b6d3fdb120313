use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::manifest::ServiceTemplate;
use crate::util::{env_bool, env_string};
use hearth_runtime::ServiceKind;

pub const DEFAULT_SETTINGS_PATH: &str = "configs/hearth.toml";
pub const MIN_HEALTH_INTERVAL_MS: u64 = 100;

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HubSection {
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub extensions_dir: Option<String>,
    #[serde(default)]
    pub sources_dir: Option<String>,
    /// Listen address, e.g. `127.0.0.1:8090`.
    #[serde(default)]
    pub bind: Option<String>,
    /// Program run as `<command> <version>` for `update_core`.
    #[serde(default)]
    pub core_update_command: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(default)]
    pub health_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub restart_window_secs: Option<u64>,
    #[serde(default)]
    pub stop_grace_ms: Option<u64>,
    #[serde(default)]
    pub restart_timeout_secs: Option<u64>,
    #[serde(default)]
    pub probe_os_ports: Option<bool>,
}

/// A hub-level service supervised alongside extensions, on a fixed port.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CoreServiceConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CoreServiceConfig {
    pub fn template(&self) -> ServiceTemplate {
        ServiceTemplate {
            id: self.id.clone(),
            kind: ServiceKind::Core,
            owner: "core".into(),
            scope: None,
            fixed_port: self.port,
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            workdir: self.workdir.as_ref().map(PathBuf::from),
            health_path: self.health_path.clone(),
        }
    }
}

/// On-disk settings file (`configs/hearth.toml`).
#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub core_services: Vec<CoreServiceConfig>,
}

static SETTINGS_SCHEMA: Lazy<std::result::Result<Validator, String>> = Lazy::new(|| {
    let schema = schemars::schema_for!(SettingsFile);
    let value = serde_json::to_value(&schema).map_err(|e| e.to_string())?;
    validator_for(&value).map_err(|e| e.to_string())
});

pub fn load_settings_file(path: &Path) -> Result<SettingsFile> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_settings(&content)
}

pub fn parse_settings(content: &str) -> Result<SettingsFile> {
    let raw: toml::Value =
        toml::from_str(content).map_err(|e| Error::Settings(e.to_string()))?;
    let json_value = serde_json::to_value(&raw).map_err(|e| Error::Settings(e.to_string()))?;
    let validator = SETTINGS_SCHEMA
        .as_ref()
        .map_err(|e| Error::Settings(format!("settings schema: {e}")))?;
    let errors: Vec<String> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(Error::Settings(errors.join(", ")));
    }
    toml::from_str(content).map_err(|e| Error::Settings(e.to_string()))
}

/// Effective settings after defaults and environment overrides.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub extensions_dir: PathBuf,
    pub sources_dir: PathBuf,
    pub bind: SocketAddr,
    pub health_interval: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub stop_grace: Duration,
    pub restart_timeout: Duration,
    pub probe_os_ports: bool,
    pub core_update_command: Option<String>,
    pub core_services: Vec<CoreServiceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::fallback()
    }
}

impl Settings {
    fn fallback() -> Self {
        let state_dir = PathBuf::from("state");
        Self {
            extensions_dir: state_dir.join("extensions"),
            sources_dir: state_dir.join("sources"),
            state_dir,
            bind: SocketAddr::from(([127, 0, 0, 1], 8090)),
            health_interval: Duration::from_millis(30_000),
            max_restarts: 2,
            restart_window: Duration::from_secs(600),
            stop_grace: Duration::from_millis(5_000),
            restart_timeout: Duration::from_secs(120),
            probe_os_ports: true,
            core_update_command: None,
            core_services: Vec::new(),
        }
    }

    /// Load from `HEARTH_CONFIG` or `configs/hearth.toml` (if present), then
    /// overlay `HEARTH_*` environment variables.
    pub fn load() -> Result<Self> {
        let explicit = env_string("HEARTH_CONFIG").map(PathBuf::from);
        let path = match explicit {
            Some(path) => Some(path),
            None => crate::resolve_config_path(DEFAULT_SETTINGS_PATH),
        };
        let file = match path {
            Some(path) => {
                info!(target: "hearth::config", path = %path.display(), "loading settings");
                load_settings_file(&path)?
            }
            None => SettingsFile::default(),
        };
        Self::from_file_and_env(file)
    }

    pub fn from_file_and_env(file: SettingsFile) -> Result<Self> {
        Self::resolve(file, &|key| env_string(key))
    }

    fn resolve(file: SettingsFile, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::fallback();
        let parse_u64 = |key: &str| -> Result<Option<u64>> {
            env(key)
                .map(|raw| {
                    raw.parse::<u64>()
                        .map_err(|_| Error::Settings(format!("{key}: expected integer, got `{raw}`")))
                })
                .transpose()
        };

        let state_dir = env("HEARTH_STATE_DIR")
            .or(file.hub.state_dir.clone())
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);
        let extensions_dir = env("HEARTH_EXTENSIONS_DIR")
            .or(file.hub.extensions_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("extensions"));
        let sources_dir = env("HEARTH_SOURCES_DIR")
            .or(file.hub.sources_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("sources"));
        let bind = match env("HEARTH_BIND").or(file.hub.bind.clone()) {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|e| Error::Settings(format!("bind `{raw}`: {e}")))?,
            None => defaults.bind,
        };

        let health_ms = parse_u64("HEARTH_HEALTH_INTERVAL_MS")?
            .or(file.supervisor.health_interval_ms)
            .unwrap_or(30_000)
            .max(MIN_HEALTH_INTERVAL_MS);
        let max_restarts = match env("HEARTH_MAX_RESTARTS") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| Error::Settings(format!("HEARTH_MAX_RESTARTS: expected integer, got `{raw}`")))?,
            None => file.supervisor.max_restarts.unwrap_or(defaults.max_restarts),
        };
        let window = parse_u64("HEARTH_RESTART_WINDOW_SECS")?
            .or(file.supervisor.restart_window_secs)
            .unwrap_or(600);
        let grace = parse_u64("HEARTH_STOP_GRACE_MS")?
            .or(file.supervisor.stop_grace_ms)
            .unwrap_or(5_000);
        let restart_timeout = parse_u64("HEARTH_RESTART_TIMEOUT_SECS")?
            .or(file.supervisor.restart_timeout_secs)
            .unwrap_or(120);
        let probe_os_ports = env("HEARTH_PROBE_OS_PORTS")
            .and_then(|raw| crate::util::parse_bool_flag(&raw))
            .or(file.supervisor.probe_os_ports)
            .unwrap_or(true);
        let core_update_command = env("HEARTH_CORE_UPDATE_CMD").or(file.hub.core_update_command);

        let mut seen = std::collections::HashSet::new();
        for svc in &file.core_services {
            if svc.id.trim().is_empty() || svc.command.trim().is_empty() {
                return Err(Error::Settings("core service needs id and command".into()));
            }
            if !seen.insert(svc.id.as_str()) {
                return Err(Error::Settings(format!("duplicate core service `{}`", svc.id)));
            }
        }

        Ok(Self {
            state_dir,
            extensions_dir,
            sources_dir,
            bind,
            health_interval: Duration::from_millis(health_ms),
            max_restarts,
            restart_window: Duration::from_secs(window),
            stop_grace: Duration::from_millis(grace),
            restart_timeout: Duration::from_secs(restart_timeout),
            probe_os_ports,
            core_update_command,
            core_services: file.core_services,
        })
    }

    /// Settings rooted in a scratch directory, for tests and embedding.
    pub fn for_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            extensions_dir: state_dir.join("extensions"),
            sources_dir: state_dir.join("sources"),
            state_dir,
            probe_os_ports: false,
            ..Self::fallback()
        }
    }
}

/// Quick check used by `env_bool`-style toggles elsewhere in the hub.
pub fn debug_mode() -> bool {
    env_bool("HEARTH_DEBUG").unwrap_or(false)
}
