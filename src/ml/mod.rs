// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that builds, adapts or trains tensors lives here.
//
//   weights.rs    — weight sources: safetensors checkpoint or
//                   seeded random init
//
//   quant.rs      — int8 absmax quantized linear layer
//
//   lora.rs       — LoRA adapter, adapted projection,
//                   PEFT adapter_config.json
//
//   model.rs      — Whisper encoder-decoder, loss, greedy
//                   decoding, adapter extraction
//
//   adaptation.rs — load → quantize → freeze → attach LoRA
//
//   schedule.rs   — linear warmup / linear decay LR schedule
//
//   trainer.rs    — training loop with gradient accumulation,
//                   per-epoch evaluation and checkpointing
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)

pub mod weights;

pub mod quant;

pub mod lora;

/// Whisper architecture in Burn
pub mod model;

pub mod adaptation;

pub mod schedule;

/// Training loop with evaluation and checkpoint observers
pub mod trainer;
