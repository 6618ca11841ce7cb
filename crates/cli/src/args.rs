use std::path::PathBuf;

use clap::{Parser, Subcommand};
use omni_prompt_config::{
    AppConfig, CompileOverride, ConfigOverride, ConfigOverrides, InspectOverride,
};
use omni_prompt_core::PositionEncoding;

#[derive(Parser, Debug)]
#[command(
    name = "omni-prompt",
    author,
    version,
    about = "Compile multimodal prompts into decoder inputs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a prompt against a shape-only vision module and print ids and positions.
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Optional path to a TOML configuration file.
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Select which model entry to load from the configuration.
    #[arg(long, value_name = "ID", help_heading = "Application")]
    pub model: Option<String>,

    /// Override the model configuration JSON path.
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub model_config: Option<PathBuf>,

    /// Override the tokenizer path.
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub tokenizer: Option<PathBuf>,

    /// Prompt text. Use `<img>name</img>` to reference images.
    #[arg(long, conflicts_with = "prompt_file")]
    pub prompt: Option<String>,

    /// Prompt file path (UTF-8).
    #[arg(long, value_name = "PATH", conflicts_with = "prompt")]
    pub prompt_file: Option<PathBuf>,

    /// Named image part referenced from the prompt, as `name=path`.
    #[arg(long = "image", value_name = "NAME=PATH", value_parser = parse_image_arg)]
    pub images: Vec<(String, PathBuf)>,

    /// Directory relative `<img>` paths are resolved against.
    #[arg(long, value_name = "DIR", help_heading = "Compile")]
    pub image_root: Option<PathBuf>,

    /// Allow `<img>` tags to reference http(s) URLs.
    #[arg(long, help_heading = "Compile")]
    pub allow_remote_images: bool,

    /// Vision module input names, in order. Overrides `visual_inputs` from the model config.
    #[arg(long = "visual-input", value_name = "NAME", help_heading = "Compile")]
    pub visual_inputs: Vec<String>,

    /// Position id layout (sequential/mrope). Defaults to the model config.
    #[arg(long, value_parser = parse_position_encoding, help_heading = "Compile")]
    pub position_encoding: Option<PositionEncoding>,

    /// Hidden width of the placeholder embeddings.
    #[arg(long, help_heading = "Inspect")]
    pub hidden_size: Option<usize>,

    /// Rows the shape-only encoder returns for the default scheme.
    #[arg(long, help_heading = "Inspect")]
    pub default_rows: Option<usize>,

    /// Print a JSON report instead of text.
    #[arg(long)]
    pub json: bool,

    /// Only log errors.
    #[arg(long)]
    pub quiet: bool,
}

fn parse_image_arg(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got `{raw}`"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

fn parse_position_encoding(raw: &str) -> Result<PositionEncoding, String> {
    match raw.to_ascii_lowercase().as_str() {
        "sequential" | "linear" => Ok(PositionEncoding::Sequential),
        "mrope" => Ok(PositionEncoding::Mrope),
        other => Err(format!(
            "unknown position encoding `{other}` (expected sequential or mrope)"
        )),
    }
}

impl From<&InspectArgs> for ConfigOverrides {
    fn from(args: &InspectArgs) -> Self {
        ConfigOverrides {
            config_path: args.config.clone(),
            model_id: args.model.clone(),
            model_config: args.model_config.clone(),
            tokenizer: args.tokenizer.clone(),
            compile: CompileOverride {
                position_encoding: args.position_encoding,
                image_root: args.image_root.clone(),
                allow_remote_images: args.allow_remote_images.then_some(true),
            },
            inspect: InspectOverride {
                hidden_size: args.hidden_size,
                default_rows: args.default_rows,
            },
        }
    }
}

impl ConfigOverride for &InspectArgs {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_args_split_on_first_equals() {
        assert_eq!(
            parse_image_arg("cat=imgs/a=b.png"),
            Ok(("cat".to_string(), PathBuf::from("imgs/a=b.png")))
        );
        assert!(parse_image_arg("cat.png").is_err());
        assert!(parse_image_arg("=cat.png").is_err());
    }

    #[test]
    fn inspect_args_parse_into_overrides() {
        let cli = Cli::parse_from([
            "omni-prompt",
            "inspect",
            "--prompt",
            "hello <img>cat</img>",
            "--image",
            "cat=cat.png",
            "--visual-input",
            "patches",
            "--visual-input",
            "position_ids",
            "--position-encoding",
            "mrope",
            "--hidden-size",
            "16",
        ]);
        let Commands::Inspect(args) = cli.command;
        assert_eq!(args.images.len(), 1);
        assert_eq!(args.visual_inputs, vec!["patches", "position_ids"]);

        let mut config = AppConfig::default();
        config += &args;
        assert_eq!(config.compile.position_encoding, Some(PositionEncoding::Mrope));
        assert_eq!(config.inspect.hidden_size, 16);
        assert!(!config.compile.allow_remote_images);
    }
}
