// ============================================================
// Layer 4 — Dataset Loader
// ============================================================
// Reads transcript records from a JSON file. Two layouts are
// accepted:
//
//   JSON lines — one object per line (blank lines skipped)
//   JSON array — a single `[ {...}, {...} ]` document
//
// Only the `audio` and `sentence` fields are used. Audio is NOT
// decoded here; that happens lazily when the dataset is read.

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};

use crate::domain::{error::DataError, record::TranscriptRecord, traits::RecordSource};

/// Loads one split from a JSON / JSON-lines file.
pub struct JsonRecordLoader {
    path: PathBuf,
}

impl JsonRecordLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for JsonRecordLoader {
    fn load_all(&self) -> Result<Vec<TranscriptRecord>> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Cannot read dataset '{}'", self.path.display()))?;

        let records = parse_records(&text, &self.path.display().to_string())?;
        tracing::info!("Loaded {} records from '{}'", records.len(), self.path.display());
        Ok(records)
    }
}

/// Parse either layout. Errors name the file and the 1-based line.
pub fn parse_records(text: &str, source: &str) -> Result<Vec<TranscriptRecord>, DataError> {
    let trimmed = text.trim_start();

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| DataError::MalformedRecord {
            path:    source.to_string(),
            line:    e.line(),
            message: e.to_string(),
        });
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<TranscriptRecord>(line).map_err(|e| DataError::MalformedRecord {
                path:    source.to_string(),
                line:    i + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Train and test records, loaded once.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Vec<TranscriptRecord>,
    pub test:  Vec<TranscriptRecord>,
}

impl DatasetSplits {
    pub fn load(train: &dyn RecordSource, test: &dyn RecordSource) -> Result<Self> {
        Ok(Self {
            train: train.load_all().context("Loading the train split")?,
            test:  test.load_all().context("Loading the test split")?,
        })
    }
}
