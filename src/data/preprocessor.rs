// ============================================================
// Layer 4 — Preprocessing Function
// ============================================================
// Maps raw examples (waveform + transcript) to model-ready
// (input_features, labels) pairs.
//
//   RawExample.audio    ──LogMelExtractor──▶ input_features
//   RawExample.sentence ──WhisperTokenizer─▶ labels
//
// Batch contract:
//   - output length == input length
//   - output[i] is derived from input[i]
//   - the first failing record's error is returned unchanged
//
// No padding happens here; that is the collator's job.

use crate::data::features::LogMelExtractor;
use crate::domain::{
    error::DataError,
    record::{PreparedExample, RawExample},
};
use crate::infra::tokenizer_store::WhisperTokenizer;

/// Feature extractor + tokenizer, the pair a Whisper checkpoint ships with.
#[derive(Debug)]
pub struct Processor {
    pub features:  LogMelExtractor,
    pub tokenizer: WhisperTokenizer,
    /// Longest label sequence the decoder can accept.
    max_label_len: usize,
}

impl Processor {
    pub fn new(features: LogMelExtractor, tokenizer: WhisperTokenizer, max_label_len: usize) -> Self {
        Self { features, tokenizer, max_label_len }
    }

    pub fn sampling_rate(&self) -> u32 {
        self.features.config().sampling_rate
    }

    /// Transform a single example.
    pub fn prepare(&self, example: &RawExample) -> Result<PreparedExample, DataError> {
        let input_features = self.features.extract(&example.audio)?;
        let labels = self.tokenizer.encode(&example.sentence)?;

        if labels.len() > self.max_label_len {
            return Err(DataError::LabelsTooLong {
                len: labels.len(),
                max: self.max_label_len,
            });
        }

        Ok(PreparedExample {
            input_features,
            n_mels:   self.features.n_mels(),
            n_frames: self.features.n_frames(),
            labels,
        })
    }

    /// Transform a batch, preserving length and order.
    pub fn prepare_batch(&self, batch: &[RawExample]) -> Result<Vec<PreparedExample>, DataError> {
        batch.iter().map(|ex| self.prepare(ex)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::features::{FeatureExtractorConfig, LogMelExtractor};
    use crate::domain::{record::AudioArray, task::Task};
    use crate::test_support::write_test_tokenizer;

    fn processor(max_label_len: usize) -> Processor {
        let dir  = tempfile::tempdir().unwrap();
        let path = write_test_tokenizer(dir.path());
        let tok  = WhisperTokenizer::from_file(&path, Task::Transcribe, None).unwrap();
        Processor::new(LogMelExtractor::new(FeatureExtractorConfig::default()), tok, max_label_len)
    }

    fn example(sentence: &str, len: usize, rate: u32) -> RawExample {
        let samples = (0..len).map(|i| ((i % 50) as f32 / 50.0) - 0.5).collect();
        RawExample {
            audio:    AudioArray::new(samples, rate),
            sentence: sentence.to_string(),
        }
    }

    #[test]
    fn test_two_records_give_two_pairs() {
        let p = processor(448);
        let batch = vec![example("hello", 16000, 16000), example("world", 8000, 16000)];

        let out = p.prepare_batch(&batch).unwrap();
        assert_eq!(out.len(), 2);
        for pair in &out {
            assert_eq!(pair.input_features.len(), 80 * 3000);
            assert_eq!((pair.n_mels, pair.n_frames), (80, 3000));
            assert!(!pair.labels.is_empty());
        }
    }

    #[test]
    fn test_order_is_preserved() {
        let p = processor(448);
        let batch = vec![
            example("hello", 1600, 16000),
            example("world", 1600, 16000),
            example("good morning", 1600, 16000),
        ];
        let out = p.prepare_batch(&batch).unwrap();
        assert_eq!(out.len(), batch.len());

        for (raw, prepared) in batch.iter().zip(&out) {
            let text = p.tokenizer.decode(&prepared.labels, true).unwrap();
            assert_eq!(text, raw.sentence);
        }
    }

    #[test]
    fn test_empty_batch() {
        let p = processor(448);
        assert!(p.prepare_batch(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_bad_sample_rate_propagates() {
        let p = processor(448);
        let batch = vec![example("hello", 1600, 16000), example("world", 1600, 44100)];
        let err = p.prepare_batch(&batch).unwrap_err();
        assert_eq!(err, DataError::UnsupportedSampleRate { got: 44100, expected: 16000 });
    }

    #[test]
    fn test_overlong_labels_are_rejected() {
        let p = processor(5);
        let err = p.prepare(&example("the cat sat on the mat", 1600, 16000)).unwrap_err();
        assert!(matches!(err, DataError::LabelsTooLong { max: 5, .. }));
    }
}
