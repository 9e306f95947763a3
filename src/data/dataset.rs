use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::sync::Arc;

use crate::data::{audio::load_audio, preprocessor::Processor};
use crate::domain::{
    error::DataError,
    record::{PreparedExample, RawExample, TranscriptRecord},
};

/// What the dataset yields per index. Errors are carried as items so
/// the DataLoader can hand them to the training loop, which fails on
/// the first one.
pub type SpeechItem = Result<PreparedExample, DataError>;

/// A split whose records are decoded and preprocessed on access.
///
/// Nothing is cached: every `get` reads the audio file, resamples it
/// and runs the preprocessing function again.
pub struct SpeechDataset {
    records:   Vec<TranscriptRecord>,
    processor: Arc<Processor>,
}

impl SpeechDataset {
    pub fn new(records: Vec<TranscriptRecord>, processor: Arc<Processor>) -> Self {
        Self { records, processor }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Decode the audio of record `index` at the processor's sample rate.
    pub fn raw(&self, index: usize) -> Option<Result<RawExample, DataError>> {
        let record = self.records.get(index)?;
        Some(
            load_audio(&record.audio, self.processor.sampling_rate()).map(|audio| RawExample {
                audio,
                sentence: record.sentence.clone(),
            }),
        )
    }

    /// Lazy, finite sequence over the split; calling it again restarts
    /// from the first record.
    pub fn examples(&self) -> impl Iterator<Item = SpeechItem> + '_ {
        (0..self.records.len()).filter_map(move |i| self.get(i))
    }
}

impl Dataset<SpeechItem> for SpeechDataset {
    fn get(&self, index: usize) -> Option<SpeechItem> {
        self.raw(index)
            .map(|raw| raw.and_then(|ex| self.processor.prepare(&ex)))
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// A split grouped into batches before it reaches the DataLoader.
///
/// Burn's loader hands each worker its own slice of the dataset and
/// batches every slice separately, so batching individual records
/// there yields more, smaller batches than `batch_size` implies.
/// Loading whole batches with a loader batch size of 1 keeps the
/// batch count at `ceil(len / batch_size)` for any worker count.
pub struct SpeechBatches {
    dataset: Arc<SpeechDataset>,
    groups:  Vec<Vec<usize>>,
}

impl SpeechBatches {
    /// Consecutive records, in file order.
    pub fn sequential(dataset: Arc<SpeechDataset>, batch_size: usize) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        Self::from_indices(dataset, indices, batch_size)
    }

    /// Records shuffled with `seed`, then grouped.
    pub fn shuffled(dataset: Arc<SpeechDataset>, batch_size: usize, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        Self::from_indices(dataset, indices, batch_size)
    }

    fn from_indices(dataset: Arc<SpeechDataset>, indices: Vec<usize>, batch_size: usize) -> Self {
        let groups = indices.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect();
        Self { dataset, groups }
    }

    pub fn batch_count(&self) -> usize {
        self.groups.len()
    }
}

impl Dataset<Vec<SpeechItem>> for SpeechBatches {
    fn get(&self, index: usize) -> Option<Vec<SpeechItem>> {
        let group = self.groups.get(index)?;
        Some(group.iter().filter_map(|&i| self.dataset.get(i)).collect())
    }

    fn len(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::features::LogMelExtractor;
    use crate::domain::{record::AudioRef, task::Task};
    use crate::infra::tokenizer_store::WhisperTokenizer;
    use crate::test_support::{tiny_feature_config, write_sine_wav, write_test_tokenizer};

    fn dataset(dir: &std::path::Path, sentences: &[&str]) -> SpeechDataset {
        let tok_path = write_test_tokenizer(dir);
        let tok = WhisperTokenizer::from_file(&tok_path, Task::Transcribe, None).unwrap();
        let processor = Arc::new(Processor::new(LogMelExtractor::new(tiny_feature_config()), tok, 24));

        let records = sentences
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let wav = dir.join(format!("{i}.wav"));
                write_sine_wav(&wav, 8000, 1, 0.3);
                TranscriptRecord {
                    audio:    AudioRef::Path(wav.display().to_string()),
                    sentence: s.to_string(),
                }
            })
            .collect();
        SpeechDataset::new(records, processor)
    }

    #[test]
    fn test_get_prepares_on_access() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path(), &["hello", "world"]);

        assert_eq!(ds.len(), 2);
        let item = ds.get(1).unwrap().unwrap();
        assert_eq!(item.input_features.len(), 8 * 100);
        assert_eq!(item.labels.len(), 3 + 1 + 1);
        assert!(ds.get(2).is_none());
    }

    #[test]
    fn test_examples_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dataset(dir.path(), &["hello", "world", "good morning"]);

        let first: Vec<_> = ds.examples().map(|r| r.unwrap().labels).collect();
        let second: Vec<_> = ds.examples().map(|r| r.unwrap().labels).collect();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_audio_surfaces_on_access() {
        let dir = tempfile::tempdir().unwrap();
        let tok_path = write_test_tokenizer(dir.path());
        let tok = WhisperTokenizer::from_file(&tok_path, Task::Transcribe, None).unwrap();
        let processor = Arc::new(Processor::new(LogMelExtractor::new(tiny_feature_config()), tok, 24));

        let ds = SpeechDataset::new(
            vec![TranscriptRecord {
                audio:    AudioRef::Path("/missing.wav".into()),
                sentence: "hello".into(),
            }],
            processor,
        );
        // constructing the dataset does not touch the file
        assert_eq!(ds.len(), 1);
        assert!(matches!(ds.get(0), Some(Err(DataError::Audio { .. }))));
    }

    #[test]
    fn test_batches_cover_every_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Arc::new(dataset(dir.path(), &["a", "b", "c", "d", "e"]));

        let sequential = SpeechBatches::sequential(ds.clone(), 2);
        assert_eq!(sequential.batch_count(), 3);
        let sizes: Vec<usize> = (0..3).map(|i| sequential.get(i).unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(sequential.get(3).is_none());

        let shuffled = SpeechBatches::shuffled(ds, 2, 7);
        let mut seen: Vec<usize> = shuffled.groups.concat();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(shuffled.batch_count(), 3);
    }
}
