use anyhow::{bail, Context, Result};
use ctxbase_core::paging::PagingLimits;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub database_path: Option<PathBuf>,
    pub project_id: Option<Uuid>,
    pub log_level: Option<String>,
    pub paging: PagingLimits,
}

impl CliConfig {
    pub fn validate(&self) -> Result<()> {
        let PagingLimits {
            default_limit,
            max_limit,
        } = self.paging;
        if max_limit == 0 {
            bail!("paging.max_limit must be at least 1");
        }
        if default_limit == 0 || default_limit > max_limit {
            bail!("paging.default_limit must be within 1..={max_limit}, got {default_limit}");
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

/// A missing file yields the defaults; a present but unreadable one is an error.
pub fn load_config(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config: CliConfig =
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var("CTXBASE_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ctxbase/config.toml")
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ctxbase/context.db")
}
