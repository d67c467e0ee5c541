use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "SHADECHAIN_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "SHADECHAIN_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "Shadechain";
const APPLICATION: &str = "shadechain";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let config_override = env_override(ENV_CONFIG_DIR);
        let data_override = env_override(ENV_DATA_DIR);
        if let (Some(config_dir), Some(data_dir)) = (&config_override, &data_override) {
            return Ok(Self {
                config_dir: config_dir.clone(),
                data_dir: data_dir.clone(),
            });
        }

        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;
        Ok(Self {
            config_dir: config_override.unwrap_or_else(|| project_dirs.config_dir().to_path_buf()),
            data_dir: data_override.unwrap_or_else(|| project_dirs.data_dir().to_path_buf()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Chain mapping used when `--chain` is not given.
    pub fn chain_file(&self) -> PathBuf {
        self.config_dir.join("chain.toml")
    }

    /// Post-processing shaders used when neither the CLI nor the chain file
    /// names a directory.
    pub fn post_dir(&self) -> PathBuf {
        self.data_dir.join("post")
    }

    /// Directory searched for a bare main shader name.
    pub fn shader_dir(&self) -> PathBuf {
        self.data_dir.join("shaders")
    }

    /// Resolves a main shader argument: existing paths win, then a file of
    /// that name under the shader directory.
    pub fn resolve_shader(&self, requested: &Path) -> PathBuf {
        if requested.exists() || requested.is_absolute() {
            return requested.to_path_buf();
        }
        let candidate = self.shader_dir().join(requested);
        if candidate.exists() {
            candidate
        } else {
            requested.to_path_buf()
        }
    }
}

#[cfg(test)]
impl AppPaths {
    pub fn from_raw(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            config_dir,
            data_dir,
        }
    }
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
