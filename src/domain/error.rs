// ============================================================
// Layer 3 — Typed Errors
// ============================================================
// Most of the program propagates anyhow::Error. The two families
// below are typed because callers look inside them:
//
//   ConfigError — raised before any data or model work starts
//   DataError   — raised while a record is decoded/preprocessed.
//                 Clone so it can travel through the burn
//                 DataLoader as part of a batch item.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("model '{0}' is not an openai/* model, check that it exists on the Hugging Face hub")]
    InvalidBaseModel(String),

    #[error("{name} must be at least 1")]
    MustBePositive { name: &'static str },

    #[error(
        "feature extractor yields {frames} frames, which the encoder reduces to {positions} \
         positions, but the model supports {max_positions}"
    )]
    FeatureLengthMismatch {
        frames:        usize,
        positions:     usize,
        max_positions: usize,
    },

    #[error("feature extractor has {extractor} mel bins but the model expects {model}")]
    MelBinMismatch { extractor: usize, model: usize },

    #[error("'{0}' is not a Whisper language, use a code such as 'zh' or a name such as 'Chinese'")]
    UnknownLanguage(String),

    #[error("tokenizer maps {token} to {tokenizer} but the model config uses {model}")]
    TokenMismatch { token: &'static str, tokenizer: u32, model: u32 },

    #[error("tokenizer has {tokenizer} tokens but the model embeds only {model}")]
    VocabularyTooLarge { tokenizer: usize, model: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error("{path}:{line}: malformed record: {message}")]
    MalformedRecord {
        path:    String,
        line:    usize,
        message: String,
    },

    #[error("cannot decode audio '{path}': {message}")]
    Audio { path: String, message: String },

    #[error("audio array is empty")]
    EmptyAudio,

    #[error("sampling rate {got} Hz is not supported, the feature extractor was trained on {expected} Hz")]
    UnsupportedSampleRate { got: u32, expected: u32 },

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("tokenization failed: {0}")]
    Tokenizer(String),

    #[error("transcript encodes to {len} tokens but the decoder accepts at most {max}")]
    LabelsTooLong { len: usize, max: usize },
}
