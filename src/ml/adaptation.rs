// ============================================================
// Layer 5 — Model Adaptation
// ============================================================
// Turns a pretrained checkpoint into a LoRA-trainable model:
//
//   1. load base weights, every linear layer quantized to int8
//   2. switch off forced decoder ids and token suppression in the
//      generation config
//   3. freeze every base parameter (norms, embeddings and convs
//      stay in full precision)
//   4. attach LoRA to the targeted attention projections
//
// Afterwards only the LoRA matrices receive gradients.

use anyhow::{Context, Result};
use burn::prelude::*;
use std::fmt;

use crate::ml::{
    lora::LoraConfig,
    model::{GenerationConfig, WhisperConfig, WhisperModel},
    weights::WeightSource,
};

/// A base model ready for adapter training.
pub struct AdaptedWhisper<B: Backend> {
    pub model:      WhisperModel<B>,
    pub generation: GenerationConfig,
    pub lora:       LoraConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSummary {
    pub trainable: usize,
    pub all:       usize,
}

impl ParamSummary {
    pub fn of<B: Backend>(model: &WhisperModel<B>) -> Self {
        Self {
            trainable: model.adapter().param_count(),
            all:       model.param_count(),
        }
    }

    pub fn trainable_percent(&self) -> f64 {
        if self.all == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.all as f64
        }
    }
}

impl fmt::Display for ParamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.all,
            self.trainable_percent()
        )
    }
}

pub fn adapt<B: Backend>(
    config:  &WhisperConfig,
    weights: &dyn WeightSource,
    lora:    &LoraConfig,
    device:  &B::Device,
) -> Result<AdaptedWhisper<B>> {
    let model = WhisperModel::<B>::load(config, weights, device)
        .context("Failed to load the base model weights")?;
    tracing::info!(
        "Base model loaded: {} encoder / {} decoder layers, d_model={}, int8 linear layers",
        config.encoder_layers,
        config.decoder_layers,
        config.d_model,
    );

    let generation = GenerationConfig::from_model_config(config).without_forced_decoding();

    let mut model = model.no_grad();

    let adapted = model.attach_lora(lora, device);
    tracing::info!(
        "LoRA r={} alpha={} dropout={} attached to {} projections ({})",
        lora.r,
        lora.lora_alpha,
        lora.lora_dropout,
        adapted,
        lora.target_modules.join(", "),
    );
    tracing::info!("{}", ParamSummary::of(&model));

    Ok(AdaptedWhisper { model, generation, lora: lora.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::weights::RandomWeights;
    use crate::test_support::tiny_whisper_config;
    use burn::{
        backend::{Autodiff, NdArray},
        optim::GradientsParams,
        tensor::TensorData,
    };

    type B = Autodiff<NdArray>;

    #[test]
    fn test_summary_format() {
        let s = ParamSummary { trainable: 25, all: 1000 };
        assert_eq!(s.to_string(), "trainable params: 25 || all params: 1000 || trainable%: 2.5000");
    }

    #[test]
    fn test_only_adapter_receives_gradients() {
        let device = Default::default();
        let lora = LoraConfig { r: 4, ..LoraConfig::default() };
        let adapted = adapt::<B>(&tiny_whisper_config(), &RandomWeights::new(1), &lora, &device).unwrap();
        assert!(adapted.generation.forced_decoder_ids.is_empty());

        let summary = ParamSummary::of(&adapted.model);
        assert!(summary.trainable > 0 && summary.trainable < summary.all);

        let features = Tensor::<B, 3>::random([1, 8, 100], burn::tensor::Distribution::Default, &device);
        let labels = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![5i64, 6, 8, 0], [1, 4]), &device);
        let (loss, _) = adapted.model.forward_loss(features, labels);

        let grads = GradientsParams::from_grads(loss.backward(), &adapted.model);
        // lora_a + lora_b for 6 adapted projections
        assert_eq!(grads.len(), 12);
    }
}
