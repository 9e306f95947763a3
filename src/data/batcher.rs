// ============================================================
// Layer 4 — Padding Collator
// ============================================================
// Implements Burn's Batcher trait to turn the prepared examples of
// one batch (grouped upstream by SpeechBatches) into tensors.
//
//   input_features: N × [n_mels, n_frames] → [N, n_mels, n_frames]
//                   (every example already has the same size)
//
//   labels:         N × variable length    → [N, max_len]
//                   padded with -100 so the loss ignores them
//
// If every label row starts with the decoder start token, that
// column is dropped: the model prepends it again when it shifts
// the labels right to build decoder inputs.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::TensorData,
};

use crate::data::dataset::SpeechItem;
use crate::domain::error::DataError;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone)]
pub struct SpeechBatch<B: Backend> {
    /// [batch, n_mels, n_frames]
    pub input_features: Tensor<B, 3>,

    /// [batch, max_label_len], IGNORE_INDEX where padded
    pub labels: Tensor<B, 2, Int>,
}

pub type SpeechBatchResult<B> = Result<SpeechBatch<B>, DataError>;

#[derive(Clone, Debug)]
pub struct SpeechCollator<B: Backend> {
    device:                 B::Device,
    decoder_start_token_id: u32,
}

impl<B: Backend> SpeechCollator<B> {
    pub fn new(device: B::Device, decoder_start_token_id: u32) -> Self {
        Self { device, decoder_start_token_id }
    }
}

impl<B: Backend> Batcher<Vec<SpeechItem>, SpeechBatchResult<B>> for SpeechCollator<B> {
    /// The loader runs with batch size 1, so `groups` normally holds a
    /// single pre-grouped batch.
    fn batch(&self, groups: Vec<Vec<SpeechItem>>) -> SpeechBatchResult<B> {
        self.collate(groups.into_iter().flatten().collect())
    }
}

impl<B: Backend> SpeechCollator<B> {
    pub fn collate(&self, items: Vec<SpeechItem>) -> SpeechBatchResult<B> {
        let items = items.into_iter().collect::<Result<Vec<_>, _>>()?;

        let batch_size = items.len();
        let (n_mels, n_frames) = items
            .first()
            .map(|ex| (ex.n_mels, ex.n_frames))
            .unwrap_or((0, 0));

        let features: Vec<f32> = items
            .iter()
            .flat_map(|ex| ex.input_features.iter().copied())
            .collect();
        let input_features = Tensor::<B, 3>::from_data(
            TensorData::new(features, [batch_size, n_mels, n_frames]),
            &self.device,
        );

        let label_rows: Vec<&[u32]> = items.iter().map(|ex| ex.labels.as_slice()).collect();
        let (padded, width) = pad_labels(&label_rows, self.decoder_start_token_id);
        let labels = Tensor::<B, 2, Int>::from_data(
            TensorData::new(padded, [batch_size, width]),
            &self.device,
        );

        Ok(SpeechBatch { input_features, labels })
    }
}

/// Pad label rows to the longest one with IGNORE_INDEX, dropping a
/// leading decoder-start column shared by all rows.
/// Returns the flattened row-major matrix and its width.
pub fn pad_labels(rows: &[&[u32]], decoder_start_token_id: u32) -> (Vec<i64>, usize) {
    let strip = !rows.is_empty()
        && rows.iter().all(|r| r.first() == Some(&decoder_start_token_id));
    let offset = usize::from(strip);

    let width = rows
        .iter()
        .map(|r| r.len().saturating_sub(offset))
        .max()
        .unwrap_or(0);

    let mut flat = Vec::with_capacity(rows.len() * width);
    for row in rows {
        let body = &row[offset.min(row.len())..];
        flat.extend(body.iter().map(|&id| id as i64));
        flat.extend(std::iter::repeat(IGNORE_INDEX).take(width - body.len()));
    }
    (flat, width)
}
