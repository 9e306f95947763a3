// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Seq2seq fine-tuning of the adapted Whisper model with Burn's
// DataLoader and AdamW.
//
//   for each epoch:
//     shuffle the records (seed + epoch) and group them into batches
//     for each micro-batch:
//       loss = CE(model(features, shift_right(labels)), labels)
//       grads += backward(loss / accumulation_steps)
//       every `accumulation_steps` micro-batches (and at the end
//       of the epoch): AdamW step with the scheduled LR
//     evaluate on the test split (loss + one greedy sample)
//     checkpoint → notify observers
//
// Key Burn points:
//   - Training runs on an AutodiffBackend; frozen parameters
//     produce no gradients, so AdamW only ever sees the adapter
//   - model.valid() returns the model on the inner backend for
//     evaluation, with dropout disabled
//   - the eval collator must build tensors on the inner backend too
//
// Reference: Burn Book §5, Loshchilov & Hutter (2019) AdamW

use anyhow::{bail, Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer},
    record::{CompactRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::data::{
    batcher::{SpeechBatch, SpeechBatchResult, SpeechCollator},
    dataset::{SpeechBatches, SpeechDataset},
};
use crate::domain::traits::{checkpoint_dir, CheckpointEvent, CheckpointObserver};
use crate::infra::{
    checkpoint::{
        load_adapter, load_full_model, read_json, save_full_model, write_json, CheckpointLayout,
        ADAPTER_DIR, OPTIMIZER_STEM, RECORD_EXTENSION, TRAINER_STATE_FILE, TRAINING_ARGS_FILE,
    },
    metrics::{MetricRecord, MetricsLogger},
    tokenizer_store::WhisperTokenizer,
};
use crate::ml::{
    adaptation::AdaptedWhisper,
    model::{loss_value, GenerationConfig, WhisperModel},
    schedule::WarmupLinearSchedule,
};

// ─── Arguments & state ────────────────────────────────────────────────────────

/// What the trainer is configured with; saved as `training_args.json`
/// in every checkpoint. Checkpointing and evaluation happen once per epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    pub output_dir:                  PathBuf,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size:  usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate:               f64,
    pub warmup_steps:                usize,
    pub num_train_epochs:            usize,
    pub fp16:                        bool,
    pub logging_steps:               usize,
    pub dataloader_num_workers:      usize,
    pub generation_max_length:       usize,
    pub seed:                        u64,
}

impl TrainingArguments {
    /// Optimizer steps per epoch for a split of `train_len` records.
    pub fn steps_per_epoch(&self, train_len: usize) -> usize {
        train_len
            .div_ceil(self.per_device_train_batch_size)
            .div_ceil(self.gradient_accumulation_steps)
    }
}

/// Progress of a run; saved as `trainer_state.json` and read back
/// when resuming.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Last completed epoch
    pub epoch:       usize,
    pub max_steps:   usize,
    pub log_history: Vec<MetricRecord>,
}

pub struct TrainOutput<B: AutodiffBackend> {
    pub model: WhisperModel<B>,
    pub state: TrainerState,
}

// ─── Trainer ──────────────────────────────────────────────────────────────────

pub struct Trainer<'a, B: AutodiffBackend> {
    args:      &'a TrainingArguments,
    device:    B::Device,
    layout:    CheckpointLayout,
    observers: Vec<&'a dyn CheckpointObserver<WhisperModel<B>>>,
}

impl<'a, B: AutodiffBackend> Trainer<'a, B> {
    pub fn new(args: &'a TrainingArguments, device: B::Device) -> Self {
        Self { args, device, layout: CheckpointLayout::default(), observers: Vec::new() }
    }

    pub fn with_observer(mut self, observer: &'a dyn CheckpointObserver<WhisperModel<B>>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn layout(&self) -> CheckpointLayout {
        self.layout
    }

    pub fn train(
        &self,
        adapted:     AdaptedWhisper<B>,
        train:       SpeechDataset,
        eval:        SpeechDataset,
        tokenizer:   &WhisperTokenizer,
        resume_from: Option<&Path>,
    ) -> Result<TrainOutput<B>> {
        let args = self.args;
        B::seed(args.seed);
        fs::create_dir_all(&args.output_dir)
            .with_context(|| format!("Cannot create output dir '{}'", args.output_dir.display()))?;
        let metrics = MetricsLogger::new(&args.output_dir)?;

        let AdaptedWhisper { mut model, generation, .. } = adapted;
        let start_token = model.decoder_start_token_id;

        let train = Arc::new(train);
        let train_len = train.record_count();
        let batches_per_epoch = train_len.div_ceil(args.per_device_train_batch_size);
        let max_steps = args.steps_per_epoch(train_len) * args.num_train_epochs;
        let schedule = WarmupLinearSchedule::new(args.learning_rate, args.warmup_steps, max_steps);
        let logging_steps = args.logging_steps.max(1);

        // ── AdamW optimiser ───────────────────────────────────────────────────
        let mut optim = AdamWConfig::new()
            .with_weight_decay(0.0)
            .init::<B, WhisperModel<B>>();

        let mut state = TrainerState { max_steps, ..TrainerState::default() };
        if let Some(dir) = resume_from {
            let (restored_model, restored_optim, restored_state) = self.restore(model, optim, dir)?;
            model = restored_model;
            optim = restored_optim;
            state = TrainerState { max_steps, ..restored_state };
            tracing::info!(
                "Resumed from '{}' at epoch {}, global step {}",
                dir.display(),
                state.epoch,
                state.global_step
            );
        }

        // ── Evaluation loader (fixed order) ───────────────────────────────────
        let eval_len = eval.record_count();
        let eval_loader = self.loader(
            SpeechCollator::<B::InnerBackend>::new(self.device.clone(), start_token),
            SpeechBatches::sequential(Arc::new(eval), args.per_device_eval_batch_size),
        );

        tracing::info!("***** Running training *****");
        tracing::info!("  Num examples = {train_len} (eval: {eval_len})");
        tracing::info!("  Num epochs = {}", args.num_train_epochs);
        tracing::info!("  Batch size = {} (eval: {})", args.per_device_train_batch_size, args.per_device_eval_batch_size);
        tracing::info!("  Gradient accumulation steps = {}", args.gradient_accumulation_steps);
        tracing::info!("  Total optimization steps = {max_steps}");
        tracing::info!("  Mixed precision = {}", args.fp16);

        // ── Epoch loop ────────────────────────────────────────────────────────
        for epoch in state.epoch + 1..=args.num_train_epochs {
            let mut accumulator = GradientsAccumulator::<WhisperModel<B>>::new();
            let mut micro_batches = 0usize;
            let mut window_loss = 0.0f64;
            let mut window_batches = 0usize;

            let epoch_batches = SpeechBatches::shuffled(
                train.clone(),
                args.per_device_train_batch_size,
                args.seed.wrapping_add(epoch as u64),
            );
            let train_loader = self.loader(SpeechCollator::<B>::new(self.device.clone(), start_token), epoch_batches);

            let mut batches = train_loader.iter().enumerate().peekable();
            while let Some((index, batch)) = batches.next() {
                let SpeechBatch { input_features, labels } = batch.with_context(|| {
                    format!("Preparing training batch {}/{} of epoch {}", index + 1, batches_per_epoch, epoch)
                })?;

                let (loss, _) = model.forward_loss(input_features, labels);
                window_loss += loss_value(loss.clone());
                window_batches += 1;

                let grads = loss.div_scalar(args.gradient_accumulation_steps as f64).backward();
                let grads = GradientsParams::from_grads(grads, &model);
                accumulator.accumulate(&model, grads);
                micro_batches += 1;

                let end_of_epoch = batches.peek().is_none();
                if micro_batches < args.gradient_accumulation_steps && !end_of_epoch {
                    continue;
                }

                let lr = schedule.lr(state.global_step);
                model = optim.step(lr, model, accumulator.grads());
                micro_batches = 0;
                state.global_step += 1;

                if state.global_step % logging_steps == 0 {
                    let record = MetricRecord::train(state.global_step, epoch, window_loss / window_batches as f64, lr);
                    tracing::info!(
                        "Epoch {:>3}/{} | step {:>6}/{} | loss={:.4} | lr={:.3e}",
                        epoch,
                        args.num_train_epochs,
                        state.global_step,
                        max_steps,
                        record.loss,
                        lr,
                    );
                    metrics.log(&record)?;
                    state.log_history.push(record);
                    window_loss = 0.0;
                    window_batches = 0;
                }
            }

            // ── Evaluation (inner backend, no autodiff) ───────────────────────
            let eval_loss = self.evaluate(&model, &eval_loader, &generation, tokenizer)?;
            let record = MetricRecord::eval(state.global_step, epoch, eval_loss);
            tracing::info!("Epoch {:>3}/{} | eval_loss={:.4}", epoch, args.num_train_epochs, eval_loss);
            metrics.log(&record)?;
            state.log_history.push(record);

            // ── Checkpoint ────────────────────────────────────────────────────
            state.epoch = epoch;
            self.save_checkpoint(&model, &optim, &state)?;
        }

        tracing::info!("Training complete after {} optimizer steps", state.global_step);
        Ok(TrainOutput { model, state })
    }

    /// One pre-grouped batch per loader item, so every worker yields
    /// whole batches.
    fn loader<BB: Backend>(
        &self,
        collator: SpeechCollator<BB>,
        batches:  SpeechBatches,
    ) -> Arc<dyn DataLoader<SpeechBatchResult<BB>>> {
        let mut builder = DataLoaderBuilder::new(collator).batch_size(1);
        if self.args.dataloader_num_workers > 0 {
            builder = builder.num_workers(self.args.dataloader_num_workers);
        }
        builder.build(batches)
    }

    fn evaluate(
        &self,
        model:      &WhisperModel<B>,
        loader:     &Arc<dyn DataLoader<SpeechBatchResult<B::InnerBackend>>>,
        generation: &GenerationConfig,
        tokenizer:  &WhisperTokenizer,
    ) -> Result<f64> {
        let valid = model.valid();

        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let batch = batch.context("Preparing evaluation batch")?;
            if batches == 0 {
                self.log_sample(&valid, &batch, generation, tokenizer)?;
            }
            let (loss, _) = valid.forward_loss(batch.input_features, batch.labels);
            loss_sum += loss_value(loss);
            batches += 1;
        }

        Ok(if batches > 0 { loss_sum / batches as f64 } else { f64::NAN })
    }

    /// Greedy-decode the first example of a batch and log it next to
    /// its reference transcript.
    fn log_sample(
        &self,
        model:      &WhisperModel<B::InnerBackend>,
        batch:      &SpeechBatch<B::InnerBackend>,
        generation: &GenerationConfig,
        tokenizer:  &WhisperTokenizer,
    ) -> Result<()> {
        let [_, n_mels, n_frames] = batch.input_features.dims();
        let first = batch.input_features.clone().slice([0..1, 0..n_mels, 0..n_frames]);
        let predicted = model.greedy_decode(first, generation, self.args.generation_max_length)?;
        let prediction = match predicted.first() {
            Some(ids) => tokenizer.decode(ids, true)?,
            None => String::new(),
        };

        let width = batch.labels.dims()[1];
        let labels: Vec<i64> = batch
            .labels
            .clone()
            .slice([0..1, 0..width])
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("Cannot read labels: {e:?}"))?;
        let reference_ids: Vec<u32> = labels.into_iter().filter(|&id| id >= 0).map(|id| id as u32).collect();
        let reference = tokenizer.decode(&reference_ids, true)?;

        tracing::info!("Eval sample | reference: {:?} | prediction: {:?}", reference, prediction);
        Ok(())
    }

    /// Write `checkpoint-<global_step>/` and notify the observers.
    fn save_checkpoint<O>(&self, model: &WhisperModel<B>, optim: &O, state: &TrainerState) -> Result<()>
    where
        O: Optimizer<WhisperModel<B>, B>,
    {
        let dir = checkpoint_dir(&self.args.output_dir, state.global_step);
        fs::create_dir_all(&dir).with_context(|| format!("Cannot create '{}'", dir.display()))?;

        save_full_model(model, &dir, self.layout.full_model_stem)?;
        let optim_path = dir.join(OPTIMIZER_STEM);
        Recorder::<B>::record(&CompactRecorder::new(), optim.to_record(), optim_path.clone())
            .with_context(|| format!("Failed to save optimizer state to '{}'", optim_path.display()))?;
        write_json(&dir.join(TRAINER_STATE_FILE), state)?;
        write_json(&dir.join(TRAINING_ARGS_FILE), self.args)?;
        tracing::debug!("Saved checkpoint '{}'", dir.display());

        let full_model_file = self.layout.full_model_file();
        let event = CheckpointEvent {
            output_dir:      &self.args.output_dir,
            global_step:     state.global_step,
            epoch:           state.epoch,
            full_model_file: &full_model_file,
        };
        for observer in &self.observers {
            observer.on_save(&event, model)?;
        }
        Ok(())
    }

    /// Restore model weights, optimizer moments and progress from a
    /// checkpoint directory. Adapter weights are preferred; the full
    /// snapshot is used when the adapter directory is missing.
    fn restore<O>(&self, model: WhisperModel<B>, optim: O, dir: &Path) -> Result<(WhisperModel<B>, O, TrainerState)>
    where
        O: Optimizer<WhisperModel<B>, B>,
    {
        let state: TrainerState = read_json(&dir.join(TRAINER_STATE_FILE))?;

        let optim_path = dir.join(OPTIMIZER_STEM).with_extension(RECORD_EXTENSION);
        let record = Recorder::<B>::load(&CompactRecorder::new(), optim_path.clone(), &self.device)
            .with_context(|| format!("Cannot load optimizer state '{}'", optim_path.display()))?;
        let optim = optim.load_record(record);

        let adapter_dir = dir.join(ADAPTER_DIR);
        let snapshot = dir.join(self.layout.full_model_file());
        let model = if adapter_dir.exists() {
            load_adapter(model, &adapter_dir, &self.device)?
        } else if snapshot.exists() {
            load_full_model(model, &snapshot, &self.device)?
        } else {
            bail!("Checkpoint '{}' contains neither '{}' nor '{}'", dir.display(), ADAPTER_DIR, snapshot.display());
        };

        Ok((model, optim, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{features::LogMelExtractor, preprocessor::Processor};
    use crate::domain::{
        record::{AudioRef, TranscriptRecord},
        task::Task,
    };
    use crate::infra::checkpoint::AdapterCheckpointer;
    use crate::ml::{
        adaptation::adapt,
        lora::{LoraConfig, PeftAdapterConfig},
        weights::RandomWeights,
    };
    use crate::test_support::{tiny_feature_config, tiny_whisper_config, write_sine_wav, write_test_tokenizer};
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray>;

    fn records(dir: &Path, prefix: &str, sentences: &[&str]) -> Vec<TranscriptRecord> {
        sentences
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let wav = dir.join(format!("{prefix}{i}.wav"));
                write_sine_wav(&wav, 16000, 1, 0.2);
                TranscriptRecord { audio: AudioRef::Path(wav.display().to_string()), sentence: s.to_string() }
            })
            .collect()
    }

    fn args(out: &Path, accumulation: usize, epochs: usize) -> TrainingArguments {
        TrainingArguments {
            output_dir:                  out.to_path_buf(),
            per_device_train_batch_size: 2,
            per_device_eval_batch_size:  2,
            gradient_accumulation_steps: accumulation,
            learning_rate:               1e-3,
            warmup_steps:                1,
            num_train_epochs:            epochs,
            fp16:                        false,
            logging_steps:               1,
            dataloader_num_workers:      1,
            generation_max_length:       8,
            seed:                        42,
        }
    }

    /// Three training records (two batches of size 2) and one test record.
    fn run(dir: &Path, args: &TrainingArguments, resume: Option<&Path>) -> TrainOutput<B> {
        run_on(dir, args, resume, &["hello world", "the cat sat", "good morning"])
    }

    fn run_on(dir: &Path, args: &TrainingArguments, resume: Option<&Path>, sentences: &[&str]) -> TrainOutput<B> {
        let tok_path = write_test_tokenizer(dir);
        let tokenizer = WhisperTokenizer::from_file(&tok_path, Task::Transcribe, None).unwrap();
        let processor = Arc::new(Processor::new(LogMelExtractor::new(tiny_feature_config()), tokenizer, 24));

        let train = SpeechDataset::new(records(dir, "train", sentences), processor.clone());
        let eval = SpeechDataset::new(records(dir, "test", &["a b c"]), processor.clone());

        let lora = LoraConfig { r: 4, ..LoraConfig::default() };
        let device = Default::default();
        let adapted = adapt::<B>(&tiny_whisper_config(), &RandomWeights::new(0), &lora, &device).unwrap();

        let observer = AdapterCheckpointer::new(PeftAdapterConfig::from_lora_config(&lora, "openai/whisper-tiny"));
        Trainer::<B>::new(args, device)
            .with_observer(&observer)
            .train(adapted, train, eval, &processor.tokenizer, resume)
            .unwrap()
    }

    #[test]
    fn test_steps_per_epoch() {
        let a = args(Path::new("out"), 2, 1);
        assert_eq!(a.steps_per_epoch(3), 1);
        assert_eq!(a.steps_per_epoch(5), 2);
        assert_eq!(args(Path::new("out"), 1, 1).steps_per_epoch(3), 2);
    }

    #[test]
    fn test_training_without_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let output = run(dir.path(), &args(&out, 1, 1), None);

        assert_eq!(output.state.global_step, 2);
        assert_eq!(output.state.epoch, 1);
        assert!(out.join("checkpoint-2/adapter_model/adapter_model.mpk").exists());
        assert!(out.join("checkpoint-2/optimizer.mpk").exists());
        assert!(out.join("checkpoint-2/trainer_state.json").exists());
        assert!(out.join("checkpoint-2/training_args.json").exists());
        assert!(!out.join("checkpoint-2/model.mpk").exists());

        let csv = fs::read_to_string(out.join("metrics.csv")).unwrap();
        // header + 2 train rows + 1 eval row
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn test_training_with_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let output = run(dir.path(), &args(&out, 2, 1), None);

        // two micro-batches, one optimizer step
        assert_eq!(output.state.global_step, 1);
        assert!(out.join("checkpoint-1/adapter_model").is_dir());
        assert!(output.state.log_history.iter().all(|r| r.loss.is_finite()));
    }

    #[test]
    fn test_resume_continues_with_next_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        run(dir.path(), &args(&out, 1, 1), None);

        let resumed = run(dir.path(), &args(&out, 1, 2), Some(&out.join("checkpoint-2")));
        assert_eq!(resumed.state.epoch, 2);
        assert_eq!(resumed.state.global_step, 4);
        assert!(out.join("checkpoint-4/adapter_model").is_dir());

        let saved: TrainerState = read_json(&out.join("checkpoint-4").join(TRAINER_STATE_FILE)).unwrap();
        assert_eq!(saved.global_step, 4);
        assert_eq!(saved.max_steps, 4);
    }

    #[test]
    fn test_worker_count_keeps_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let args = TrainingArguments {
            per_device_train_batch_size: 4,
            dataloader_num_workers:      2,
            warmup_steps:                0,
            ..args(&out, 1, 1)
        };
        let output = run_on(dir.path(), &args, None, &["a b", "b c", "c d", "d e"]);

        // four records, batch size 4: one step however many workers load them
        assert_eq!(output.state.global_step, 1);
        assert_eq!(output.state.max_steps, 1);
        let rates: Vec<f64> = output.state.log_history.iter().filter_map(|r| r.learning_rate).collect();
        assert_eq!(rates.len(), 1);
        assert!(rates.iter().all(|&lr| lr > 0.0), "{rates:?}");
    }
}
