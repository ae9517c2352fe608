//! Server configuration.
//!
//! YAML file (path from `--config` or `BROOK_CONFIG`), then environment
//! overrides:
//!   BROOK_LOG_PATH      partition log file
//!   BROOK_PARTITION_ID  partition id

use anyhow::{Context, Result};
use brook_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "BROOK_CONFIG";
pub const LOG_PATH_ENV: &str = "BROOK_LOG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub engine: EngineConfig,

    /// JSON-lines file backing the partition log.
    pub log_path: PathBuf,

    /// Directory of `*.yaml` process models deployed at startup.
    pub models_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            log_path: PathBuf::from("brook.log.jsonl"),
            models_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(content).context("Failed to parse server config")?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Loads `path`, falling back to `BROOK_CONFIG`, then to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_yaml(&content)?
            }
            None => Self::default(),
        };
        config.with_overrides(|name| std::env::var(name).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup(LOG_PATH_ENV) {
            self.log_path = PathBuf::from(path);
        }
        self.engine = self.engine.with_overrides(&lookup)?;
        Ok(self)
    }

    /// Process model files in `models_dir`, sorted by name.
    pub fn model_files(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = &self.models_dir else {
            return Ok(Vec::new());
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read models dir {}", dir.display()))?
        {
            let path = entry?.path();
            if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config = ServerConfig::from_yaml("engine:\n  partition_id: 2\n").unwrap();
        assert_eq!(config.engine.partition_id, 2);
        assert_eq!(config.log_path, PathBuf::from("brook.log.jsonl"));

        let config = config
            .with_overrides(|name| match name {
                LOG_PATH_ENV => Some("/tmp/p1.jsonl".to_string()),
                "BROOK_PARTITION_ID" => Some("4".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.log_path, PathBuf::from("/tmp/p1.jsonl"));
        assert_eq!(config.engine.partition_id, 4);
    }

    #[test]
    fn test_model_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "").unwrap();
        std::fs::write(dir.path().join("a.yml"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let config = ServerConfig {
            models_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let files = config.model_files().unwrap();
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.yml", "b.yaml"]);
    }
}
