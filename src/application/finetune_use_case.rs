// ============================================================
// Layer 2 — FinetuneUseCase
// ============================================================
// Orchestrates a LoRA fine-tuning run in order:
//
//   Step 1: Validate the configuration    (fails before any I/O)
//   Step 2: Resolve base model files      (Layer 6 - infra)
//   Step 3: Build feature extractor +
//           tokenizer                     (Layer 4 / 6)
//   Step 4: Load dataset splits           (Layer 4 - data)
//   Step 5: Load, quantize and adapt
//           the model                     (Layer 5 - ml)
//   Step 6: Train with the adapter-only
//           checkpoint observer           (Layer 5 / 6)
//   Step 7: Save the final model          (Layer 6 - infra)
//
// The compute backend is chosen once, here, from the config:
//   cpu          → Autodiff<NdArray<f32, i32>>
//   wgpu         → Autodiff<Wgpu>
//   wgpu + fp16  → Autodiff<Wgpu<f16>>
// Every backend uses 32-bit integers, which hold four packed int8
// base weights each.

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use crate::data::{
    dataset::SpeechDataset,
    features::{FeatureExtractorConfig, LogMelExtractor},
    loader::{DatasetSplits, JsonRecordLoader},
    preprocessor::Processor,
};
use crate::domain::{error::ConfigError, language::language_code, task::Task};
use crate::infra::{
    checkpoint::{save_final, AdapterCheckpointer},
    model_store::{resolve_base_model, validate_base_model},
    tokenizer_store::WhisperTokenizer,
};
use crate::ml::{
    adaptation::adapt,
    lora::{LoraConfig, PeftAdapterConfig},
    model::WhisperConfig,
    trainer::{Trainer, TrainingArguments},
    weights::SafetensorsWeights,
};

// ─── Device selection ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Wgpu,
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Wgpu => "wgpu",
            DeviceKind::Cpu => "cpu",
        })
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceKind::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceKind::Cpu),
            other => Err(format!("unknown device '{other}', expected 'wgpu' or 'cpu'")),
        }
    }
}

// ─── Fine-tuning Configuration ───────────────────────────────────────────────
// Built once from the command line and passed by reference to every
// stage. Serialisable so a run can be logged and reproduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneConfig {
    pub train_data:                  PathBuf,
    pub test_data:                   PathBuf,
    pub base_model:                  String,
    pub output_path:                 PathBuf,
    pub logging_steps:               usize,
    pub warmup_steps:                usize,
    pub num_workers:                 usize,
    pub learning_rate:               f64,
    pub num_train_epochs:            usize,
    pub task:                        Task,
    pub language:                    Option<String>,
    pub resume_from_checkpoint:      Option<PathBuf>,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size:  usize,
    pub gradient_accumulation_steps: usize,
    pub generation_max_length:       usize,
    pub device:                      DeviceKind,
    pub fp16:                        bool,
    pub seed:                        u64,
    pub local_rank:                  usize,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            train_data:                  "dataset/train.json".into(),
            test_data:                   "dataset/test.json".into(),
            base_model:                  "openai/whisper-large-v2".into(),
            output_path:                 "models/whisper-large-v2-lora".into(),
            logging_steps:               100,
            warmup_steps:                50,
            num_workers:                 8,
            learning_rate:               1e-3,
            num_train_epochs:            3,
            task:                        Task::Transcribe,
            language:                    None,
            resume_from_checkpoint:      None,
            per_device_train_batch_size: 8,
            per_device_eval_batch_size:  8,
            gradient_accumulation_steps: 1,
            generation_max_length:       128,
            device:                      DeviceKind::Wgpu,
            fp16:                        true,
            seed:                        42,
            local_rank:                  0,
        }
    }
}

impl FinetuneConfig {
    /// Checks that need no I/O. Runs before anything is loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_base_model(&self.base_model)?;

        if let Some(language) = &self.language {
            if language_code(language).is_none() {
                return Err(ConfigError::UnknownLanguage(language.clone()));
            }
        }

        let positive = [
            ("per_device_train_batch_size", self.per_device_train_batch_size),
            ("per_device_eval_batch_size", self.per_device_eval_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
            ("generation_max_length", self.generation_max_length),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::MustBePositive { name });
            }
        }
        Ok(())
    }

    /// Only the primary process writes the final model.
    pub fn is_primary(&self) -> bool {
        self.local_rank == 0
    }

    pub fn training_arguments(&self) -> TrainingArguments {
        TrainingArguments {
            output_dir:                  self.output_path.clone(),
            per_device_train_batch_size: self.per_device_train_batch_size,
            per_device_eval_batch_size:  self.per_device_eval_batch_size,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            learning_rate:               self.learning_rate,
            warmup_steps:                self.warmup_steps,
            num_train_epochs:            self.num_train_epochs,
            fp16:                        self.fp16,
            logging_steps:               self.logging_steps,
            dataloader_num_workers:      self.num_workers,
            generation_max_length:       self.generation_max_length,
            seed:                        self.seed,
        }
    }
}

// ─── FinetuneUseCase ─────────────────────────────────────────────────────────
pub struct FinetuneUseCase {
    config: FinetuneConfig,
}

impl FinetuneUseCase {
    pub fn new(config: FinetuneConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<()> {
        let cfg = &self.config;

        // ── Step 1: Validate ──────────────────────────────────────────────────
        cfg.validate()?;

        match (cfg.device, cfg.fp16) {
            (DeviceKind::Cpu, fp16) => {
                if fp16 {
                    tracing::warn!("fp16 is not available on the cpu backend, training in f32");
                }
                self.run::<Autodiff<NdArray<f32, i32>>>(NdArrayDevice::default())
            }
            (DeviceKind::Wgpu, true) => self.run::<Autodiff<Wgpu<half::f16, i32>>>(WgpuDevice::default()),
            (DeviceKind::Wgpu, false) => self.run::<Autodiff<Wgpu>>(WgpuDevice::default()),
        }
    }

    fn run<B: AutodiffBackend>(&self, device: B::Device) -> Result<()> {
        let cfg = &self.config;
        tracing::info!("Using {} device: {:?} (fp16={})", cfg.device, device, cfg.fp16);

        // ── Step 2: Base model files ──────────────────────────────────────────
        let files = resolve_base_model(&cfg.base_model)?;
        let model_config = WhisperConfig::from_file(&files.config)?;

        // ── Step 3: Feature extractor + tokenizer ─────────────────────────────
        // The extractor output must match the encoder input exactly
        let features = LogMelExtractor::new(FeatureExtractorConfig::from_file_or_default(&files.preprocessor)?);
        model_config.check_features(features.n_mels(), features.n_frames())?;

        let tokenizer = WhisperTokenizer::from_file(&files.tokenizer, cfg.task, cfg.language.as_deref())?;
        model_config.check_tokenizer(&tokenizer)?;
        tracing::info!("Tokenizer ready: task={}, prompt={:?}", cfg.task, tokenizer.prefix_tokens());
        let processor = Arc::new(Processor::new(features, tokenizer, model_config.max_target_positions));

        // ── Step 4: Dataset splits ────────────────────────────────────────────
        // Records only; audio is decoded lazily by the datasets
        let splits = DatasetSplits::load(
            &JsonRecordLoader::new(&cfg.train_data),
            &JsonRecordLoader::new(&cfg.test_data),
        )?;
        tracing::info!("Dataset: {} train, {} test records", splits.train.len(), splits.test.len());
        let train = SpeechDataset::new(splits.train, processor.clone());
        let test  = SpeechDataset::new(splits.test, processor.clone());

        // ── Step 5: Quantized base model + LoRA ───────────────────────────────
        let weights = SafetensorsWeights::open(&files.weights)?;
        let lora = LoraConfig::default();
        let adapted = adapt::<B>(&model_config, &weights, &lora, &device)
            .with_context(|| format!("Failed to prepare '{}' for LoRA training", cfg.base_model))?;

        // ── Step 6: Train ─────────────────────────────────────────────────────
        let peft = PeftAdapterConfig::from_lora_config(&lora, &cfg.base_model);
        let observer = AdapterCheckpointer::new(peft.clone());
        let args = cfg.training_arguments();
        let trainer = Trainer::<B>::new(&args, device).with_observer(&observer);
        tracing::info!(
            "Checkpoints go to '{}/checkpoint-<step>' (snapshot file '{}' is replaced by adapter_model/)",
            args.output_dir.display(),
            trainer.layout().full_model_file(),
        );

        let output = trainer.train(
            adapted,
            train,
            test,
            &processor.tokenizer,
            cfg.resume_from_checkpoint.as_deref(),
        )?;

        // ── Step 7: Final model ───────────────────────────────────────────────
        if cfg.is_primary() {
            save_final(&output.model, &args.output_dir, &peft)?;
        } else {
            tracing::info!("local_rank={} is not the primary process, skipping final save", cfg.local_rank);
        }
        Ok(())
    }
}
