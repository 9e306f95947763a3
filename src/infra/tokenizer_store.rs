// ============================================================
// Layer 6 — Whisper Tokenizer
// ============================================================
// Wraps a HuggingFace `tokenizer.json` and adds the Whisper
// decoder prompt around every transcript:
//
//   <|startoftranscript|> [<|lang|>] <|task|> <|notimestamps|>
//   ... text tokens ...
//   <|endoftext|>
//
// Decoding with skip_special_tokens drops the prompt again, so
// tokenize → detokenize returns the original text.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tokenizers::Tokenizer;

use crate::domain::{
    error::{ConfigError, DataError},
    language::{language_code, language_token},
    task::Task,
};

pub const START_OF_TRANSCRIPT: &str = "<|startoftranscript|>";
pub const END_OF_TEXT: &str = "<|endoftext|>";
pub const NO_TIMESTAMPS: &str = "<|notimestamps|>";

pub struct WhisperTokenizer {
    inner:  Tokenizer,
    prefix: Vec<u32>,
    sot:    u32,
    eot:    u32,
}

impl std::fmt::Debug for WhisperTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTokenizer")
            .field("prefix", &self.prefix)
            .field("eot", &self.eot)
            .finish()
    }
}

impl WhisperTokenizer {
    /// Load `tokenizer.json` and resolve the prompt tokens for `task`.
    pub fn from_file(path: &Path, task: Task, language: Option<&str>) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Cannot load tokenizer from '{}': {}", path.display(), e))?;
        Self::from_tokenizer(inner, task, language)
            .with_context(|| format!("Tokenizer '{}' is not a Whisper tokenizer", path.display()))
    }

    pub fn from_tokenizer(inner: Tokenizer, task: Task, language: Option<&str>) -> Result<Self> {
        let id = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| anyhow!("special token '{token}' is missing from the vocabulary"))
        };

        let sot = id(START_OF_TRANSCRIPT)?;
        let eot = id(END_OF_TEXT)?;

        let mut prefix = vec![sot];
        if let Some(lang) = language {
            let code = language_code(lang).ok_or_else(|| ConfigError::UnknownLanguage(lang.to_string()))?;
            prefix.push(id(&language_token(code))?);
        }
        prefix.push(id(&task.token())?);
        prefix.push(id(NO_TIMESTAMPS)?);

        Ok(Self { inner, prefix, sot, eot })
    }

    /// Prompt tokens + text tokens + end-of-text.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, DataError> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| DataError::Tokenizer(e.to_string()))?;

        let mut ids = Vec::with_capacity(self.prefix.len() + enc.len() + 1);
        ids.extend_from_slice(&self.prefix);
        ids.extend_from_slice(enc.get_ids());
        ids.push(self.eot);
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("Detokenisation error: {e}"))
    }

    pub fn prefix_tokens(&self) -> &[u32] {
        &self.prefix
    }

    pub fn sot_id(&self) -> u32 {
        self.sot
    }

    pub fn eot_id(&self) -> u32 {
        self.eot
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
