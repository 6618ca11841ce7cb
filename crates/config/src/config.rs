use std::{
    collections::BTreeMap,
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use omni_prompt_core::PositionEncoding;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelRegistry,
    pub compile: CompileSettings,
    pub inspect: InspectSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRegistry {
    pub active: String,
    pub entries: BTreeMap<String, ModelEntry>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(DEFAULT_MODEL.to_string(), ModelEntry::default());
        Self {
            active: DEFAULT_MODEL.to_string(),
            entries,
        }
    }
}

const DEFAULT_MODEL: &str = "default";

/// Files of one exported model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEntry {
    /// Model `config.json`.
    pub config: Option<PathBuf>,
    /// `tokenizer.json`.
    pub tokenizer: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileSettings {
    /// Overrides the encoding implied by the model config.
    pub position_encoding: Option<PositionEncoding>,
    /// Directory relative image paths are resolved against.
    pub image_root: Option<PathBuf>,
    pub allow_remote_images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectSettings {
    pub hidden_size: usize,
    /// Rows reported by the shape-only encoder for the default scheme.
    pub default_rows: usize,
}

impl Default for InspectSettings {
    fn default() -> Self {
        Self {
            hidden_size: 8,
            default_rows: 16,
        }
    }
}

/// Resolved file locations of the active model.
#[derive(Debug, Clone)]
pub struct ModelResources {
    pub id: String,
    pub config: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
}

impl ModelResources {
    pub fn config_path(&self) -> Result<&Path> {
        self.config
            .as_deref()
            .ok_or_else(|| anyhow!("model `{}` has no config.json configured", self.id))
    }

    pub fn tokenizer_path(&self) -> Result<&Path> {
        self.tokenizer
            .as_deref()
            .ok_or_else(|| anyhow!("model `{}` has no tokenizer configured", self.id))
    }
}

/// Where the configuration was read from; `None` when running on built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigDescriptor {
    pub location: Option<PathBuf>,
}

impl AppConfig {
    /// Reads `path`, writing the defaults there first when the file does not exist.
    pub fn load_or_init(path: Option<&Path>) -> Result<(Self, ConfigDescriptor)> {
        let Some(path) = path else {
            return Ok((Self::default(), ConfigDescriptor::default()));
        };
        let path_buf = path.to_path_buf();
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
            let cfg = Self::default();
            let serialized = toml::to_string_pretty(&cfg)?;
            fs::write(&path_buf, serialized).with_context(|| {
                format!("failed to write configuration to {}", path_buf.display())
            })?;
            debug!(path = %path_buf.display(), "wrote default configuration");
            return Ok((
                cfg,
                ConfigDescriptor {
                    location: Some(path_buf),
                },
            ));
        }

        let contents = fs::read_to_string(&path_buf)
            .with_context(|| format!("failed to read configuration from {}", path_buf.display()))?;
        let mut cfg: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse configuration at {}", path_buf.display()))?;
        cfg.normalise();
        Ok((
            cfg,
            ConfigDescriptor {
                location: Some(path_buf),
            },
        ))
    }

    pub fn load_with_overrides(
        overrides: ConfigOverrides,
    ) -> Result<(Self, ConfigDescriptor, ModelResources)> {
        let config_path = overrides.config_path.clone();
        let (mut config, descriptor) = Self::load_or_init(config_path.as_deref())?;
        config += overrides;
        config.normalise();
        let resources = config.active_model_resources()?;
        Ok((config, descriptor, resources))
    }

    pub fn normalise(&mut self) {
        if !self.models.entries.contains_key(&self.models.active) {
            self.models
                .entries
                .insert(self.models.active.clone(), ModelEntry::default());
        }
    }

    pub fn active_model_resources(&self) -> Result<ModelResources> {
        self.model_resources(&self.models.active)
    }

    pub fn model_resources(&self, model_id: &str) -> Result<ModelResources> {
        let entry = self
            .models
            .entries
            .get(model_id)
            .ok_or_else(|| anyhow!("model `{model_id}` not found in configuration"))?;
        Ok(ModelResources {
            id: model_id.to_string(),
            config: entry.config.clone(),
            tokenizer: entry.tokenizer.clone(),
        })
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(model_id) = overrides.model_id.as_ref() {
            self.models.active = model_id.clone();
            self.models.entries.entry(model_id.clone()).or_default();
        }

        if let Some(entry) = self.models.entries.get_mut(&self.models.active) {
            if let Some(path) = overrides.model_config.as_ref() {
                entry.config = Some(path.clone());
            }
            if let Some(path) = overrides.tokenizer.as_ref() {
                entry.tokenizer = Some(path.clone());
            }
        }

        if overrides.compile.position_encoding.is_some() {
            self.compile.position_encoding = overrides.compile.position_encoding;
        }
        if let Some(root) = overrides.compile.image_root.as_ref() {
            self.compile.image_root = Some(root.clone());
        }
        if let Some(allow) = overrides.compile.allow_remote_images {
            self.compile.allow_remote_images = allow;
        }
        if let Some(hidden_size) = overrides.inspect.hidden_size {
            self.inspect.hidden_size = hidden_size;
        }
        if let Some(default_rows) = overrides.inspect.default_rows {
            self.inspect.default_rows = default_rows;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub model_id: Option<String>,
    pub model_config: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub compile: CompileOverride,
    pub inspect: InspectOverride,
}

#[derive(Debug, Default, Clone)]
pub struct CompileOverride {
    pub position_encoding: Option<PositionEncoding>,
    pub image_root: Option<PathBuf>,
    pub allow_remote_images: Option<bool>,
}

#[derive(Debug, Default, Clone)]
pub struct InspectOverride {
    pub hidden_size: Option<usize>,
    pub default_rows: Option<usize>,
}

pub trait ConfigOverride {
    fn apply(self, config: &mut AppConfig);
}

impl ConfigOverride for ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&self);
    }
}

impl ConfigOverride for &ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(self);
    }
}

impl<O: ConfigOverride> AddAssign<O> for AppConfig {
    fn add_assign(&mut self, rhs: O) {
        rhs.apply(self);
    }
}

pub fn save_config(descriptor: &ConfigDescriptor, config: &AppConfig) -> Result<()> {
    let path = descriptor
        .location
        .as_ref()
        .ok_or_else(|| anyhow!("configuration has no file location to save to"))?;
    let serialized = toml::to_string_pretty(config)?;
    fs::write(path, serialized)
        .with_context(|| format!("failed to write configuration to {}", path.display()))
}
