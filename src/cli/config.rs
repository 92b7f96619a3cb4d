use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Which state store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Json,
    Memory,
}

/// Configuration loaded from `ironbpm.yaml`.
/// All fields are optional; missing fields fall back to CLI flags, env or defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct IronBpmConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_dir: Option<String>,
    pub store: Option<StoreKind>,
    pub max_body: Option<usize>,
    /// Ceiling on nodes entered in one automatic run of an instance.
    pub max_auto_steps: Option<usize>,
}

impl IronBpmConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `ironbpm.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("ironbpm.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(contents)?)
    }
}
