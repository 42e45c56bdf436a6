use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::validated_relative_path;
use crate::{PatchError, PatchResult};

pub const CONFIG_FILE_NAME: &str = "patchkit.toml";
pub const DEFAULT_STATE_DIR: &str = ".patchkit";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchConfig {
    #[serde(default)]
    pub patch: PatchInfo,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    pub runtime: Option<RuntimeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchInfo {
    #[serde(default = "default_patch_name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub executable: Option<String>,
}

/// Third-party runtime the patch needs at game launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub installed_marker: Option<String>,
}

impl Default for PatchInfo {
    fn default() -> Self {
        Self {
            name: default_patch_name(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            exclude: Vec::new(),
        }
    }
}

fn default_patch_name() -> String {
    "patch".to_string()
}

fn default_state_dir() -> String {
    DEFAULT_STATE_DIR.to_string()
}

impl PatchConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        let config: Self =
            toml::from_str(input).map_err(|err| format!("failed to parse patch config: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `patchkit.toml` from `dir`, falling back to defaults when absent.
    pub fn load_from_dir(dir: &Path) -> PatchResult<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(PatchError::file_operation("read patch config", path, err)),
        };

        Self::from_toml_str(&raw).map_err(|reason| PatchError::Config { path, reason })
    }

    /// Reserved state directory, relative to the install root.
    pub fn state_dir(&self) -> PathBuf {
        validated_relative_path(&self.install.state_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn excluded_paths(&self) -> Vec<PathBuf> {
        self.install
            .exclude
            .iter()
            .filter_map(|raw| validated_relative_path(raw))
            .collect()
    }

    fn validate(&self) -> Result<(), String> {
        if self.patch.name.trim().is_empty() {
            return Err("patch.name must not be empty".to_string());
        }
        if validated_relative_path(&self.install.state_dir).is_none() {
            return Err(format!(
                "install.state_dir must be a relative path inside the install root: '{}'",
                self.install.state_dir
            ));
        }
        for raw in &self.install.exclude {
            if validated_relative_path(raw).is_none() {
                return Err(format!(
                    "install.exclude entries must be relative paths inside the staging root: '{raw}'"
                ));
            }
        }
        if let Some(executable) = &self.discovery.executable {
            if executable.trim().is_empty() || executable.contains(['/', '\\']) {
                return Err(format!(
                    "discovery.executable must be a bare file name: '{executable}'"
                ));
            }
        }
        if let Some(runtime) = &self.runtime {
            if runtime.program.trim().is_empty() {
                return Err("runtime.program must not be empty".to_string());
            }
        }
        Ok(())
    }
}
