pub mod config;
pub mod model;

pub use config::{
    AppConfig, CompileOverride, CompileSettings, ConfigDescriptor, ConfigOverride,
    ConfigOverrides, InspectOverride, InspectSettings, ModelEntry, ModelRegistry, ModelResources,
    save_config,
};
pub use model::ModelConfig;
