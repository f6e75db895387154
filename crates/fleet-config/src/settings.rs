//! Tool settings
//!
//! Settings are looked up in order: an explicit path, `$FLEET_SETTINGS`,
//! then `<config dir>/fleet/settings.yaml`. A missing file yields defaults.
//! String values may reference `${VAR}` and `${VAR:-default}`.

use crate::{Result, interpolate::interpolate, parser};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming a settings file
pub const SETTINGS_ENV: &str = "FLEET_SETTINGS";

/// Cloud provider access
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Default region
    pub region: Option<String>,
    /// Named credential profile
    pub profile: Option<String>,
}

/// Remote shell defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Login user
    pub user: Option<String>,
    /// Port
    pub port: Option<u16>,
    /// Private key
    pub identity_file: Option<PathBuf>,
    /// Provider key pair name
    pub key_name: Option<String>,
}

/// Configuration-management bootstrap defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Agent version
    pub version: Option<String>,
    /// Bootstrap template
    pub distro: Option<String>,
}

/// Settings for the fleet tool itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Inventory file used when `--inventory` is not given
    pub inventory: Option<PathBuf>,
    /// Extra mixin directories, searched after the built-ins
    pub mixin_dirs: Vec<PathBuf>,
    /// Where rendered scripts are written
    pub script_dir: Option<PathBuf>,
    /// Provider access
    pub provider: ProviderSettings,
    /// Remote shell defaults
    pub ssh: SshSettings,
    /// Bootstrap defaults
    pub bootstrap: BootstrapSettings,
    /// Default worker-pool size
    pub batch_size: Option<usize>,
}

impl Settings {
    /// Load settings, falling back to defaults when no file exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match Self::locate(explicit) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No settings file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// The settings file that would be used, if any
    ///
    /// An explicit path is returned even when it does not exist so that
    /// loading reports it.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(SETTINGS_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir()
            .map(|dir| dir.join("fleet").join("settings.yaml"))
            .filter(|path| path.exists())
    }

    /// Load settings from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());
        let content = parser::read_file(path)?;
        Self::from_str(&content)
    }

    /// Parse settings from YAML, interpolating string values
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let mut value = parser::parse_yaml(content)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        interpolate_strings(&mut value, &HashMap::new())?;
        serde_json::from_value(value)
            .map_err(|e| crate::ConfigError::ValidationError(format!("settings: {}", e)))
    }

    /// Settings expressed as lowest-precedence run parameters
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        let mut set = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        };
        set("region", self.provider.region.clone().map(Value::from));
        set("ssh_user", self.ssh.user.clone().map(Value::from));
        set("ssh_port", self.ssh.port.map(Value::from));
        set(
            "identity_file",
            self.ssh
                .identity_file
                .as_ref()
                .map(|p| Value::from(p.display().to_string())),
        );
        set("key_name", self.ssh.key_name.clone().map(Value::from));
        set("bootstrap_version", self.bootstrap.version.clone().map(Value::from));
        set("distro", self.bootstrap.distro.clone().map(Value::from));
        set("batch_size", self.batch_size.map(Value::from));
        params
    }
}

fn interpolate_strings(value: &mut Value, vars: &HashMap<String, String>) -> Result<()> {
    match value {
        Value::String(s) => *s = interpolate(s, vars)?,
        Value::Array(items) => {
            for item in items {
                interpolate_strings(item, vars)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                interpolate_strings(item, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}
