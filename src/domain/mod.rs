// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust structs, enums and traits describing the
// fine-tuning problem: dataset records, the task mode, the
// two typed error families and the checkpoint observer seam.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O or network calls
//   - Only plain Rust structs, enums, and traits
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// Dataset records, decoded audio and prepared feature/label pairs
pub mod record;

// Whisper task mode (transcribe / translate)
pub mod task;

// Language names and codes accepted by --language
pub mod language;

// Configuration and data error types
pub mod error;

// Core abstractions (traits) that other layers implement
pub mod traits;
