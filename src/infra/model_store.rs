// ============================================================
// Layer 6 — Base Model Store
// ============================================================
// Resolves a base model identifier to the four files a Whisper
// checkpoint is made of:
//
//   config.json               — architecture + generation settings
//   tokenizer.json            — HuggingFace tokenizer
//   preprocessor_config.json  — feature extractor settings (optional)
//   model.safetensors         — weights
//
// Only `openai/<name>` identifiers are accepted. A local
// directory at that relative path wins; otherwise the files are
// fetched into (or read from) the Hugging Face Hub cache.

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};

use crate::domain::error::ConfigError;

pub const CONFIG_FILE:       &str = "config.json";
pub const TOKENIZER_FILE:    &str = "tokenizer.json";
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
pub const WEIGHTS_FILE:      &str = "model.safetensors";

const NAMESPACE: &str = "openai";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config:       PathBuf,
    pub tokenizer:    PathBuf,
    /// Missing file means Whisper defaults
    pub preprocessor: PathBuf,
    pub weights:      PathBuf,
}

impl ModelFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            config:       dir.join(CONFIG_FILE),
            tokenizer:    dir.join(TOKENIZER_FILE),
            preprocessor: dir.join(PREPROCESSOR_FILE),
            weights:      dir.join(WEIGHTS_FILE),
        }
    }
}

/// The identifier must be `openai/<name>`.
pub fn validate_base_model(id: &str) -> Result<(), ConfigError> {
    match id.rsplit_once('/') {
        Some((NAMESPACE, name)) if !name.is_empty() => Ok(()),
        _ => Err(ConfigError::InvalidBaseModel(id.to_string())),
    }
}

pub fn resolve_base_model(id: &str) -> Result<ModelFiles> {
    validate_base_model(id)?;

    let local = Path::new(id);
    if local.is_dir() {
        tracing::info!("Using local base model directory '{}'", local.display());
        return Ok(ModelFiles::in_dir(local));
    }

    tracing::info!("Fetching '{}' from the Hugging Face Hub", id);
    let api = Api::new().context("Failed to initialise the Hugging Face Hub client")?;
    let repo = api.repo(Repo::new(id.to_string(), RepoType::Model));

    let fetch = |file: &str| {
        repo.get(file)
            .with_context(|| format!("Cannot fetch '{file}' for model '{id}'"))
    };

    let config = fetch(CONFIG_FILE)?;
    let tokenizer = fetch(TOKENIZER_FILE)?;
    let weights = fetch(WEIGHTS_FILE)?;
    let preprocessor = match repo.get(PREPROCESSOR_FILE) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!("No {} for '{}' ({}), using defaults", PREPROCESSOR_FILE, id, e);
            config.with_file_name(PREPROCESSOR_FILE)
        }
    };

    Ok(ModelFiles { config, tokenizer, preprocessor, weights })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_check() {
        assert!(validate_base_model("openai/whisper-large-v2").is_ok());
        assert!(validate_base_model("openai/whisper-tiny").is_ok());

        for bad in ["whisper-large-v2", "facebook/whisper", "openai/", "models/openai/whisper", ""] {
            assert_eq!(
                validate_base_model(bad),
                Err(ConfigError::InvalidBaseModel(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_invalid_id_never_touches_the_hub() {
        let err = resolve_base_model("facebook/wav2vec2").unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn test_file_names() {
        let files = ModelFiles::in_dir(Path::new("openai/whisper-tiny"));
        assert_eq!(files.weights, Path::new("openai/whisper-tiny/model.safetensors"));
        assert_eq!(files.preprocessor, Path::new("openai/whisper-tiny/preprocessor_config.json"));
    }
}
