// ============================================================
// Layer 6 — Checkpoint Files
// ============================================================
// Saves and restores model weights with Burn's named MessagePack
// recorders, plus the JSON side files. Adapter weights use the
// CompactRecorder (half-precision floats). The full model is kept
// at full precision: its packed int8 weights need all 32 bits of
// every integer, which CompactRecorder would narrow to i16.
//
// Per-epoch checkpoint, as left behind after the observer ran:
//
//   <output_dir>/
//     checkpoint-<global_step>/
//       adapter_model/
//         adapter_model.mpk     ← LoRA weights only
//         adapter_config.json   ← PEFT-style adapter description
//       optimizer.mpk           ← AdamW moments
//       trainer_state.json      ← global step, epoch, log history
//       training_args.json      ← the arguments of the run
//
// The trainer first writes `model.mpk` (the full adapted model)
// into the checkpoint; AdapterCheckpointer replaces it with the
// adapter_model/ directory. The file name is published through
// CheckpointLayout so both sides agree on it.
//
// Final output, written once after training:
//
//   <output_dir>/model.mpk, adapter_model.mpk, adapter_config.json
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{CompactRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::traits::{CheckpointEvent, CheckpointObserver};
use crate::ml::{lora::PeftAdapterConfig, model::WhisperModel};

/// Extension the MessagePack recorders append to every record file.
pub const RECORD_EXTENSION: &str = "mpk";

type FullModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub const ADAPTER_DIR:         &str = "adapter_model";
pub const ADAPTER_STEM:        &str = "adapter_model";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const OPTIMIZER_STEM:      &str = "optimizer";
pub const TRAINER_STATE_FILE:  &str = "trainer_state.json";
pub const TRAINING_ARGS_FILE:  &str = "training_args.json";

/// Where the trainer puts the full-model snapshot inside a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointLayout {
    pub full_model_stem: &'static str,
}

impl Default for CheckpointLayout {
    fn default() -> Self {
        Self { full_model_stem: "model" }
    }
}

impl CheckpointLayout {
    /// e.g. `model.mpk`
    pub fn full_model_file(&self) -> String {
        format!("{}.{}", self.full_model_stem, RECORD_EXTENSION)
    }
}

// ─── Full model ───────────────────────────────────────────────────────────────

/// Write every parameter to `<dir>/<stem>.mpk`.
pub fn save_full_model<B: Backend>(model: &WhisperModel<B>, dir: &Path, stem: &str) -> Result<PathBuf> {
    let path = dir.join(stem);
    FullModelRecorder::new()
        .record(model.clone().into_record(), path.clone())
        .with_context(|| format!("Failed to save model to '{}'", path.display()))?;
    Ok(path.with_extension(RECORD_EXTENSION))
}

pub fn load_full_model<B: Backend>(model: WhisperModel<B>, file: &Path, device: &B::Device) -> Result<WhisperModel<B>> {
    let record = FullModelRecorder::new()
        .load(file.to_path_buf(), device)
        .with_context(|| format!("Cannot load model '{}'", file.display()))?;
    Ok(model.load_record(record))
}

// ─── Adapter ──────────────────────────────────────────────────────────────────

/// Write `adapter_model.mpk` and `adapter_config.json` into `dir`.
pub fn write_adapter_files<B: Backend>(model: &WhisperModel<B>, dir: &Path, config: &PeftAdapterConfig) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Cannot create '{}'", dir.display()))?;

    let path = dir.join(ADAPTER_STEM);
    CompactRecorder::new()
        .record(model.adapter().into_record(), path.clone())
        .with_context(|| format!("Failed to save adapter to '{}'", path.display()))?;

    write_json(&dir.join(ADAPTER_CONFIG_FILE), config)
}

/// Replace `<checkpoint>/adapter_model/` with a freshly written adapter.
/// The files go to a sibling temp directory first and are renamed
/// into place. An existing adapter is moved aside, not deleted, until
/// the new one is in place, so a complete adapter exists at every point.
pub fn save_adapter<B: Backend>(model: &WhisperModel<B>, checkpoint: &Path, config: &PeftAdapterConfig) -> Result<PathBuf> {
    let target = checkpoint.join(ADAPTER_DIR);
    let staging = checkpoint.join(format!(".{ADAPTER_DIR}.tmp"));
    let previous = checkpoint.join(format!(".{ADAPTER_DIR}.old"));

    // an interrupted swap left the only complete adapter aside
    if previous.exists() && !target.exists() {
        fs::rename(&previous, &target)
            .with_context(|| format!("Cannot restore '{}'", previous.display()))?;
    }
    for leftover in [&staging, &previous] {
        if leftover.exists() {
            fs::remove_dir_all(leftover)
                .with_context(|| format!("Cannot clear '{}'", leftover.display()))?;
        }
    }
    write_adapter_files(model, &staging, config)?;

    let replaced = target.exists();
    if replaced {
        fs::rename(&target, &previous)
            .with_context(|| format!("Cannot move '{}' aside", target.display()))?;
    }
    fs::rename(&staging, &target)
        .with_context(|| format!("Cannot move adapter into '{}'", target.display()))?;
    if replaced {
        fs::remove_dir_all(&previous)
            .with_context(|| format!("Cannot delete '{}'", previous.display()))?;
    }
    Ok(target)
}

/// Load adapter weights from `dir` into a model that already has
/// adapters attached in the same places.
pub fn load_adapter<B: Backend>(model: WhisperModel<B>, dir: &Path, device: &B::Device) -> Result<WhisperModel<B>> {
    let path = dir.join(ADAPTER_STEM).with_extension(RECORD_EXTENSION);
    let record = CompactRecorder::new()
        .load(path.clone(), device)
        .with_context(|| format!("Cannot load adapter '{}'", path.display()))?;
    let adapter = model.adapter().load_record(record);
    model.with_adapter(adapter)
}

/// Final output: the full adapted model plus the adapter files,
/// directly under `dir`.
pub fn save_final<B: Backend>(model: &WhisperModel<B>, dir: &Path, config: &PeftAdapterConfig) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Cannot create '{}'", dir.display()))?;
    let model_path = save_full_model(model, dir, CheckpointLayout::default().full_model_stem)?;
    write_adapter_files(model, dir, config)?;
    tracing::info!("Saved final model to '{}' and adapter to '{}'", model_path.display(), dir.display());
    Ok(())
}

/// Delete the full-model snapshot if it is there.
/// Returns whether a file was removed; a missing file is not an error.
pub fn remove_full_snapshot(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path).with_context(|| format!("Cannot delete '{}'", path.display()))?;
    Ok(true)
}

// ─── JSON side files ──────────────────────────────────────────────────────────

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Cannot write '{}'", path.display()))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Cannot parse '{}'", path.display()))
}

// ─── Observer ─────────────────────────────────────────────────────────────────

/// Keeps checkpoints small: persists the adapter and drops the
/// full-model snapshot the trainer wrote.
pub struct AdapterCheckpointer {
    config: PeftAdapterConfig,
}

impl AdapterCheckpointer {
    pub fn new(config: PeftAdapterConfig) -> Self {
        Self { config }
    }
}

impl<B: Backend> CheckpointObserver<WhisperModel<B>> for AdapterCheckpointer {
    fn on_save(&self, event: &CheckpointEvent<'_>, model: &WhisperModel<B>) -> Result<()> {
        let checkpoint = event.checkpoint_dir();
        let adapter_dir = save_adapter(model, &checkpoint, &self.config)?;

        let removed = remove_full_snapshot(&event.full_model_path())?;
        tracing::info!(
            "Checkpoint {}: adapter saved to '{}'{}",
            event.global_step,
            adapter_dir.display(),
            if removed { ", full snapshot removed" } else { "" },
        );
        Ok(())
    }
}
