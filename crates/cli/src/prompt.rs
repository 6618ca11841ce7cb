use std::fs;

use anyhow::{Context, Result, anyhow};
use omni_prompt_core::{ImagePart, MultimodalPrompt};

use crate::args::InspectArgs;

pub fn load_template(args: &InspectArgs) -> Result<String> {
    if let Some(path) = &args.prompt_file {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()))
            .map(|s| s.trim_end().to_owned());
    }
    if let Some(prompt) = &args.prompt {
        return Ok(prompt.clone());
    }
    Err(anyhow!("prompt is required (use --prompt or --prompt-file)"))
}

/// Builds the prompt with every `--image name=path` decoded as an embedded part.
pub fn load_prompt(args: &InspectArgs) -> Result<MultimodalPrompt> {
    let mut prompt = MultimodalPrompt::new(load_template(args)?);
    for (name, path) in &args.images {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read image `{name}` from {}", path.display()))?;
        let part = ImagePart::from_bytes(&bytes)
            .with_context(|| format!("failed to decode image `{name}` at {}", path.display()))?;
        prompt = prompt.with_image(name.clone(), part);
    }
    Ok(prompt)
}
