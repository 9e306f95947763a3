// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Files and external services the other layers rely on:
//
//   model_store.rs     — resolves `openai/<name>` to local files,
//                        fetching them from the Hugging Face Hub
//                        when needed
//
//   tokenizer_store.rs — loads tokenizer.json and wraps it with
//                        the Whisper task prompt
//
//   checkpoint.rs      — MessagePack model / adapter records,
//                        JSON side files, and the observer that
//                        keeps only adapter weights in checkpoints
//
//   metrics.rs         — training / evaluation metrics CSV
//
// Reference: Rust Book §7 (Modules)
//            Burn Book §5 (Checkpointing)

/// Base model resolution (local dir or HF Hub)
pub mod model_store;

/// Whisper tokenizer with task prompt tokens
pub mod tokenizer_store;

/// Model and adapter checkpoint files
pub mod checkpoint;

/// Metrics CSV logger
pub mod metrics;
