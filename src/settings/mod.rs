//! Global settings document: listener endpoints, module configs, staging and
//! logging options. Stored as pretty-printed JSON.

pub mod watcher;

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub use watcher::ConfigWatcher;

pub const SETTINGS_ENV: &str = "SWITCHYARD_SETTINGS";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub modules: Vec<ModuleConfig>,
    /// Root for staging directories (`<system temp>/switchyard` when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_folder: Option<PathBuf>,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub endpoints: Vec<EndpointConfig>,
    /// Largest request body forwarded to a module, in bytes
    pub max_request_body: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            endpoints: vec![EndpointConfig::default()],
            max_request_body: 16 * 1024 * 1024,
        }
    }
}

/// One listener. Two endpoints are the same endpoint iff all fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Requests arriving here are treated as https (TLS terminated in front)
    pub secure: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            secure: false,
        }
    }
}

impl EndpointConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// True when both cannot be bound at the same time: same port, and the
    /// same address or a wildcard on either side.
    pub fn conflicts_with(&self, other: &EndpointConfig) -> bool {
        self.port != 0
            && self.port == other.port
            && (self.bind == other.bind || self.bind.is_unspecified() || other.bind.is_unspecified())
    }
}

impl std::fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.addr())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Operator-chosen instance name
    pub name: String,
    /// Module binary; staged copies are made from this path
    pub binary: PathBuf,
    /// Implementation to pick when the binary provides several
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,
    /// Extra path patterns to watch, on top of the module's own filters
    pub monitor: Vec<String>,
    pub hooks: Vec<HookConfig>,
    /// Opaque, module-defined
    pub settings: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub protocol: HookProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Match the domain exactly, not its subdomains
    pub specific_domain: bool,
    /// Match the path exactly, not the paths below it
    pub specific_path: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookProtocol {
    #[default]
    Any,
    Http,
    Https,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, used when `RUST_LOG` is not set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Append log output to this file instead of stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Settings {
    /// 파일에서 설정 로드
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path).map_err(|e| EngineError::ConfigLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| EngineError::ConfigLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// First-run load: a missing file yields defaults that are written back;
    /// a corrupt file yields defaults but is left untouched for the operator.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Settings file {} does not exist, writing defaults", path.display());
            let settings = Self::default();
            settings.save(path)?;
            return Ok(settings);
        }
        match Self::load(path) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::error!("{}; starting with default settings", e);
                Ok(Self::default())
            }
        }
    }

    /// 파일에 설정 저장
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Replace the settings blob of the named module. Returns false when no
    /// module with that name is configured any more.
    pub fn apply_module_save(&mut self, name: &str, blob: Value) -> bool {
        match self.modules.iter_mut().find(|m| m.name == name) {
            Some(module) => {
                module.settings = blob;
                true
            }
            None => false,
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.temp_folder
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("switchyard"))
    }
}

/// Settings path: explicit option, then `SWITCHYARD_SETTINGS`, then the
/// per-user config directory.
pub fn resolve_settings_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(SETTINGS_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    crate::utils::config_dir().join(SETTINGS_FILE)
}
