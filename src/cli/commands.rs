// ============================================================
// Layer 1 — CLI Arguments
// ============================================================
// Every flag of a fine-tuning run. The defaults reproduce the
// reference recipe (whisper-large-v2, 3 epochs, lr 1e-3).
//
// clap's derive macros automatically generate:
//   - help text (--help)
//   - error messages for bad values
//   - type conversion (string → usize, f64, Task, ...)
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{ArgAction, Args};
use std::path::PathBuf;

use crate::application::finetune_use_case::{DeviceKind, FinetuneConfig};
use crate::domain::task::Task;

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// JSON-lines file with the training records
    #[arg(long, default_value = "dataset/train.json")]
    pub train_data: PathBuf,

    /// JSON-lines file with the evaluation records
    #[arg(long, default_value = "dataset/test.json")]
    pub test_data: PathBuf,

    /// Base Whisper model, must be `openai/<name>`
    #[arg(long, default_value = "openai/whisper-large-v2")]
    pub base_model: String,

    /// Where checkpoints and the final model are written
    #[arg(long, default_value = "models/whisper-large-v2-lora")]
    pub output_path: PathBuf,

    /// Log the training loss every N optimizer steps
    #[arg(long, default_value_t = 100)]
    pub logging_steps: usize,

    #[arg(long, default_value_t = 50)]
    pub warmup_steps: usize,

    /// Data loader worker threads (0 = load on the training thread)
    #[arg(long, default_value_t = 8)]
    pub num_workers: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 3)]
    pub num_train_epochs: usize,

    /// transcribe or translate
    #[arg(long, default_value = "transcribe")]
    pub task: Task,

    /// Language of the audio, as a code ("zh") or a name ("Chinese");
    /// omit for multilingual data
    #[arg(long)]
    pub language: Option<String>,

    /// Checkpoint directory to resume from
    #[arg(long)]
    pub resume_from_checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 8)]
    pub per_device_train_batch_size: usize,

    #[arg(long, default_value_t = 8)]
    pub per_device_eval_batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,

    /// Maximum number of tokens generated during evaluation
    #[arg(long, default_value_t = 128)]
    pub generation_max_length: usize,

    /// wgpu or cpu
    #[arg(long, default_value = "wgpu")]
    pub device: DeviceKind,

    /// Half-precision training (wgpu only)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub fp16: bool,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Rank of this process; only rank 0 writes the final model
    #[arg(long, env = "LOCAL_RANK", default_value_t = 0)]
    pub local_rank: usize,
}

/// Convert CLI TrainArgs into the application-layer FinetuneConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for FinetuneConfig {
    fn from(a: TrainArgs) -> Self {
        FinetuneConfig {
            train_data:                  a.train_data,
            test_data:                   a.test_data,
            base_model:                  a.base_model,
            output_path:                 a.output_path,
            logging_steps:               a.logging_steps,
            warmup_steps:                a.warmup_steps,
            num_workers:                 a.num_workers,
            learning_rate:               a.learning_rate,
            num_train_epochs:            a.num_train_epochs,
            task:                        a.task,
            language:                    a.language,
            resume_from_checkpoint:      a.resume_from_checkpoint,
            per_device_train_batch_size: a.per_device_train_batch_size,
            per_device_eval_batch_size:  a.per_device_eval_batch_size,
            gradient_accumulation_steps: a.gradient_accumulation_steps,
            generation_max_length:       a.generation_max_length,
            device:                      a.device,
            fp16:                        a.fp16,
            seed:                        a.seed,
            local_rank:                  a.local_rank,
        }
    }
}
