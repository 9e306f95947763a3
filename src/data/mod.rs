// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from the dataset JSON to GPU-ready batches:
//
//   train.json / test.json
//       │
//       ▼
//   JsonRecordLoader  → TranscriptRecord (audio ref + sentence)
//       │
//       ▼   ── lazily, on every access ──
//   audio             → decode WAV, down-mix, resample to 16 kHz
//       │
//       ▼
//   Processor         → log-mel features + label token ids
//       │
//       ▼
//   SpeechDataset     → implements Burn's Dataset trait
//       │
//       ▼
//   SpeechBatches     → groups record indices into batches
//       │
//       ▼
//   SpeechCollator    → stacks features, pads labels with -100
//       │
//       ▼
//   DataLoader        → worker threads feed the training loop
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Reads transcript records from JSON / JSON-lines files
pub mod loader;

/// WAV decoding, segment selection and resampling
pub mod audio;

/// Whisper log-mel spectrogram extraction
pub mod features;

/// The preprocessing function: raw example → (features, labels)
pub mod preprocessor;

/// Lazy Burn Datasets over one split and its batches
pub mod dataset;

/// Burn Batcher that pads labels into tensor batches
pub mod batcher;
