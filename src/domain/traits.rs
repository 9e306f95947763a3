// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// RecordSource      — anything that yields dataset records
// CheckpointObserver — anything that reacts to a checkpoint
//                      written by the trainer
//
// The observer is generic over the model type so this layer
// stays free of Burn types.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::domain::record::TranscriptRecord;

/// Name prefix of per-step checkpoint directories.
pub const CHECKPOINT_PREFIX: &str = "checkpoint";

// ─── RecordSource ─────────────────────────────────────────────────────────────
/// Any component that can load transcript records.
pub trait RecordSource {
    fn load_all(&self) -> Result<Vec<TranscriptRecord>>;
}

// ─── CheckpointEvent ──────────────────────────────────────────────────────────
/// What the trainer tells observers after it has written a checkpoint.
///
/// `full_model_file` is the file name (relative to the checkpoint
/// directory) under which the trainer stored the full model snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointEvent<'a> {
    pub output_dir:      &'a Path,
    pub global_step:     usize,
    pub epoch:           usize,
    pub full_model_file: &'a str,
}

impl CheckpointEvent<'_> {
    /// `<output_dir>/checkpoint-<global_step>`
    pub fn checkpoint_dir(&self) -> PathBuf {
        checkpoint_dir(self.output_dir, self.global_step)
    }

    pub fn full_model_path(&self) -> PathBuf {
        self.checkpoint_dir().join(self.full_model_file)
    }
}

pub fn checkpoint_dir(output_dir: &Path, global_step: usize) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}-{global_step}"))
}

// ─── CheckpointObserver ───────────────────────────────────────────────────────
/// Invoked once per checkpoint event. Observers only touch the
/// filesystem; they never change what the trainer does next.
/// An error is fatal for the training run.
pub trait CheckpointObserver<M> {
    fn on_save(&self, event: &CheckpointEvent<'_>, model: &M) -> Result<()>;
}
