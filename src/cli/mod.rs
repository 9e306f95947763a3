// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// One command: fine-tune `--base-model` on `--train-data`,
// evaluate on `--test-data`, write to `--output-path`.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::TrainArgs;

use crate::application::finetune_use_case::{FinetuneConfig, FinetuneUseCase};

#[derive(Parser, Debug)]
#[command(
    name = "whisper-lora-finetune",
    version = "0.1.0",
    about = "Fine-tune a Whisper model with a LoRA adapter over int8 base weights."
)]
pub struct Cli {
    #[command(flatten)]
    pub args: TrainArgs,
}

impl Cli {
    /// Print the effective configuration, then hand off to Layer 2.
    pub fn run(self) -> Result<()> {
        let config: FinetuneConfig = self.args.into();
        log_arguments(&config);

        FinetuneUseCase::new(config.clone()).execute()?;

        if config.is_primary() {
            println!("Fine-tuning complete. Model saved to '{}'.", config.output_path.display());
        }
        Ok(())
    }
}

/// One line per argument, so a log file fully describes the run.
fn log_arguments(config: &FinetuneConfig) {
    tracing::info!("----------------- Configuration Arguments -----------------");
    match serde_json::to_value(config) {
        Ok(serde_json::Value::Object(fields)) => {
            for (name, value) in fields {
                tracing::info!("{name}: {value}");
            }
        }
        _ => tracing::info!("{config:?}"),
    }
    tracing::info!("------------------------------------------------------------");
}
