// ============================================================
// Layer 5 — Low-Rank Adapters (LoRA)
// ============================================================
// A frozen projection W is augmented with a trainable low-rank
// update:
//
//   h = x·W + (dropout(x) · A · B) · (alpha / r)
//
//   A: [d_input, r]   Kaiming-uniform init
//   B: [r, d_output]  zero init → the adapted layer starts out
//                     identical to the base layer
//
// Only A and B receive gradients.
//
// Reference: Hu et al. (2021) LoRA: Low-Rank Adaptation of LLMs

use burn::{
    module::Param,
    nn::{Dropout, DropoutConfig},
    prelude::*,
    tensor::Distribution,
};
use serde::{Deserialize, Serialize};

use crate::ml::quant::QuantizedLinear;

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoraConfig {
    pub r:              usize,
    pub lora_alpha:     f64,
    pub lora_dropout:   f64,
    pub target_modules: Vec<String>,
    pub bias:           String,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r:              32,
            lora_alpha:     64.0,
            lora_dropout:   0.05,
            target_modules: vec!["q_proj".into(), "v_proj".into()],
            bias:           "none".into(),
        }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    /// Whether a projection called `name` (e.g. "q_proj") gets an adapter.
    pub fn targets(&self, name: &str) -> bool {
        self.target_modules.iter().any(|t| t == name)
    }

    pub fn init<B: Backend>(&self, d_input: usize, d_output: usize, device: &B::Device) -> LoraAdapter<B> {
        // kaiming_uniform(a = √5) on a fan-in of d_input
        let bound = 1.0 / (d_input as f64).sqrt();
        let lora_a = Tensor::<B, 2>::random([d_input, self.r], Distribution::Uniform(-bound, bound), device);
        let lora_b = Tensor::<B, 2>::zeros([self.r, d_output], device);

        LoraAdapter {
            lora_a:  Param::from_tensor(lora_a),
            lora_b:  Param::from_tensor(lora_b),
            dropout: DropoutConfig::new(self.lora_dropout).init(),
            scaling: self.scaling(),
        }
    }
}

// ─── Adapter ──────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct LoraAdapter<B: Backend> {
    /// [d_input, r]
    pub lora_a:  Param<Tensor<B, 2>>,
    /// [r, d_output]
    pub lora_b:  Param<Tensor<B, 2>>,
    pub dropout: Dropout,
    pub scaling: f64,
}

impl<B: Backend> LoraAdapter<B> {
    pub fn param_count(&self) -> usize {
        self.lora_a.shape().num_elements() + self.lora_b.shape().num_elements()
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        self.dropout
            .forward(input)
            .matmul(self.lora_a.val().unsqueeze())
            .matmul(self.lora_b.val().unsqueeze())
            .mul_scalar(self.scaling)
    }
}

// ─── Adapted projection ───────────────────────────────────────────────────────

/// A quantized base projection with an optional adapter on top.
/// Projections that are not LoRA targets carry `lora: None`.
#[derive(Module, Debug)]
pub struct AdaptedLinear<B: Backend> {
    pub base: QuantizedLinear<B>,
    pub lora: Option<LoraAdapter<B>>,
}

impl<B: Backend> AdaptedLinear<B> {
    pub fn new(base: QuantizedLinear<B>) -> Self {
        Self { base, lora: None }
    }

    pub fn attach(&mut self, config: &LoraConfig, device: &B::Device) {
        self.lora = Some(config.init(self.base.d_input(), self.base.d_output(), device));
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        match &self.lora {
            Some(lora) => self.base.forward(input.clone()) + lora.forward(input),
            None => self.base.forward(input),
        }
    }
}

// ─── PEFT adapter_config.json ─────────────────────────────────────────────────

/// Written next to the adapter weights so the adapter can be matched
/// to its base model later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeftAdapterConfig {
    pub peft_type:               String,
    pub task_type:               String,
    pub base_model_name_or_path: String,
    pub r:                       usize,
    pub lora_alpha:              f64,
    pub lora_dropout:            f64,
    pub target_modules:          Vec<String>,
    pub bias:                    String,
    #[serde(default)]
    pub fan_in_fan_out:          bool,
    #[serde(default)]
    pub inference_mode:          bool,
}

impl PeftAdapterConfig {
    pub fn from_lora_config(config: &LoraConfig, base_model: &str) -> Self {
        let mut target_modules = config.target_modules.clone();
        target_modules.sort();
        Self {
            peft_type: "LORA".into(),
            task_type: "SEQ_2_SEQ_LM".into(),
            base_model_name_or_path: base_model.into(),
            r: config.r,
            lora_alpha: config.lora_alpha,
            lora_dropout: config.lora_dropout,
            target_modules,
            bias: config.bias.clone(),
            fan_in_fan_out: false,
            inference_mode: true,
        }
    }

    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            r:              self.r,
            lora_alpha:     self.lora_alpha,
            lora_dropout:   self.lora_dropout,
            target_modules: self.target_modules.clone(),
            bias:           self.bias.clone(),
        }
    }
}
