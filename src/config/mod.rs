//! Configuration system for Yuki-Frame.
//!
//! Two on-disk formats are accepted:
//! 1. INI (`yuki-frame.conf`): `[framework]` plus one `[tool.<name>]` per tool
//! 2. YAML (`*.yml` / `*.yaml`): `framework:` map plus a `tools:` map keyed by name
//!
//! Search order when no explicit path is given:
//! 1. ./yuki-frame.conf
//! 2. ~/.config/yuki-frame/yuki-frame.conf
//! 3. Defaults (no tools)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

pub use self::framework::{FrameworkConfig, LogLevel};
pub use self::tool::{QueuePolicy, ToolDefinition, WILDCARD, parse_subscriptions};

use crate::error::{FrameError, Result};

mod framework;
mod ini;
mod tool;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "yuki-frame.conf";

/// Fully loaded configuration: framework settings plus the tool definition set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub framework: FrameworkConfig,
    pub tools: Vec<ToolDefinition>,
}

/// YAML layout; tool names come from the map keys.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct YamlConfig {
    framework: FrameworkConfig,
    tools: BTreeMap<String, ToolDefinition>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// A discovered file that fails to load is an error, same as an explicit one.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // Explicit path takes precedence and must load
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }
        Self::load_first(&Self::search_paths())
    }

    /// Default locations, in search order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("yuki-frame").join(DEFAULT_CONFIG_FILE));
        }
        paths
    }

    /// Load the first candidate that exists, or defaults if none do
    pub fn load_first(candidates: &[PathBuf]) -> Result<Self> {
        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(path),
            None => {
                log::info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate a single file, choosing the format by extension
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| FrameError::Config(format!("Cannot read {}: {}", path.display(), e)))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Self::from_yaml(&content)?,
            _ => Self::from_ini(&content)?,
        };
        config.validate()?;

        log::info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn from_ini(content: &str) -> Result<Self> {
        ini::parse(content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: YamlConfig = serde_yaml::from_str(content)?;
        let tools = raw
            .tools
            .into_iter()
            .map(|(name, mut def)| {
                def.name = name;
                def
            })
            .collect();
        Ok(Self {
            framework: raw.framework,
            tools,
        })
    }

    /// Validate framework settings and every tool definition
    pub fn validate(&self) -> Result<()> {
        self.framework.validate()?;

        if self.tools.len() > self.framework.max_tools {
            return Err(FrameError::Config(format!(
                "{} tools configured but max_tools is {}",
                self.tools.len(),
                self.framework.max_tools
            )));
        }

        let mut names = HashSet::new();
        for tool in &self.tools {
            tool.validate()?;
            if !names.insert(tool.name.as_str()) {
                return Err(FrameError::Config(format!("Duplicate tool name: {}", tool.name)));
            }
        }
        Ok(())
    }
}
