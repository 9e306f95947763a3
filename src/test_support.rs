// Fixtures shared by unit tests: a tiny word-level tokenizer with
// the Whisper special tokens, WAV files, and small model settings.

use std::path::{Path, PathBuf};

use crate::data::features::FeatureExtractorConfig;
use crate::ml::model::WhisperConfig;

pub const SPECIAL_TOKENS: [&str; 8] = [
    "<|endoftext|>",
    "<|startoftranscript|>",
    "<|en|>",
    "<|zh|>",
    "<|translate|>",
    "<|transcribe|>",
    "<|notimestamps|>",
    "[UNK]",
];

pub const WORDS: [&str; 12] = [
    "hello", "world", "the", "cat", "sat", "on", "mat", "good", "morning", "a", "b", "c",
];

pub fn test_vocab_size() -> usize {
    SPECIAL_TOKENS.len() + WORDS.len()
}

/// Write a HuggingFace-format word-level `tokenizer.json` into `dir`.
pub fn write_test_tokenizer(dir: &Path) -> PathBuf {
    let mut vocab = serde_json::Map::new();
    for (id, tok) in SPECIAL_TOKENS.iter().chain(WORDS.iter()).enumerate() {
        vocab.insert(tok.to_string(), serde_json::json!(id));
    }

    let added_tokens: Vec<_> = SPECIAL_TOKENS
        .iter()
        .enumerate()
        .filter(|(_, t)| **t != "[UNK]")
        .map(|(id, t)| {
            serde_json::json!({
                "id": id, "content": t, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();

    let tokenizer_json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "[UNK]"
        }
    });

    let path = dir.join("tokenizer.json");
    std::fs::write(&path, serde_json::to_string_pretty(&tokenizer_json).unwrap()).unwrap();
    path
}

/// Write a 16-bit PCM sine tone.
pub fn write_sine_wav(path: &Path, sample_rate: u32, channels: u16, secs: f32) {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let frames = (secs * sample_rate as f32) as usize;
    for i in 0..frames {
        let v = 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin();
        for _ in 0..channels {
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
    }
    writer.finalize().unwrap();
}

/// 8 mel bins over 1 s → 100 frames → 50 encoder positions.
pub fn tiny_feature_config() -> FeatureExtractorConfig {
    FeatureExtractorConfig {
        feature_size:  8,
        sampling_rate: 16000,
        hop_length:    160,
        chunk_length:  1,
        n_fft:         400,
        padding_value: 0.0,
    }
}

pub fn tiny_whisper_config() -> WhisperConfig {
    WhisperConfig {
        vocab_size:              test_vocab_size(),
        num_mel_bins:            8,
        d_model:                 16,
        encoder_layers:          1,
        encoder_attention_heads: 2,
        encoder_ffn_dim:         32,
        decoder_layers:          1,
        decoder_attention_heads: 2,
        decoder_ffn_dim:         32,
        max_source_positions:    50,
        max_target_positions:    24,
        decoder_start_token_id:  1,
        pad_token_id:            0,
        eos_token_id:            0,
        forced_decoder_ids:      Some(vec![(1, 2), (2, 5)]),
        suppress_tokens:         vec![7],
        begin_suppress_tokens:   vec![0],
    }
}
