// ============================================================
// Layer 5 — Whisper Encoder-Decoder
// ============================================================
// Burn port of the Whisper architecture, laid out so HuggingFace
// checkpoints load by name:
//
//   input_features [B, n_mels, 3000]
//       │ conv1 (k3, s1) → GELU → conv2 (k3, s2) → GELU
//       ▼
//   [B, 1500, d_model] + sinusoidal positions
//       │ N × pre-norm encoder layer (self-attn, MLP)
//       ▼
//   encoder_hidden_states ───────────────────────┐
//                                                │
//   decoder_input_ids [B, T]                     │
//       │ embed_tokens + learned positions       │
//       │ N × pre-norm decoder layer             │
//       │   (causal self-attn, cross-attn ◀──────┘, MLP)
//       ▼
//   logits = h · embed_tokensᵀ  (tied output projection)
//
// Every linear layer is an AdaptedLinear: an int8 base plus an
// optional LoRA adapter. Convolutions, embeddings and layer norms
// stay in full precision.
//
// Reference: Radford et al. (2022) Robust Speech Recognition via
//            Large-Scale Weak Supervision

use anyhow::{bail, Context, Result};
use burn::{
    module::Param,
    prelude::*,
    tensor::{
        activation::{gelu, log_softmax, softmax},
        module::{conv1d, embedding},
        ops::ConvOptions,
        ElementConversion, TensorData,
    },
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::batcher::IGNORE_INDEX;
use crate::domain::error::ConfigError;
use crate::infra::tokenizer_store::{WhisperTokenizer, END_OF_TEXT, START_OF_TRANSCRIPT};
use crate::ml::{
    lora::{AdaptedLinear, LoraAdapter, LoraConfig},
    quant::QuantizedLinear,
    weights::WeightSource,
};

const LAYER_NORM_EPS: f64 = 1e-5;

// ─── Configuration ────────────────────────────────────────────────────────────

/// The subset of a HuggingFace Whisper `config.json` this model uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WhisperConfig {
    pub vocab_size:              usize,
    pub num_mel_bins:            usize,
    pub d_model:                 usize,
    pub encoder_layers:          usize,
    pub encoder_attention_heads: usize,
    pub encoder_ffn_dim:         usize,
    pub decoder_layers:          usize,
    pub decoder_attention_heads: usize,
    pub decoder_ffn_dim:         usize,
    pub max_source_positions:    usize,
    pub max_target_positions:    usize,
    pub decoder_start_token_id:  u32,
    pub pad_token_id:            u32,
    pub eos_token_id:            u32,
    #[serde(default)]
    pub forced_decoder_ids:      Option<Vec<(usize, u32)>>,
    #[serde(default)]
    pub suppress_tokens:         Vec<u32>,
    #[serde(default)]
    pub begin_suppress_tokens:   Vec<u32>,
}

impl WhisperConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read model config '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("'{}' is not a Whisper config", path.display()))
    }

    /// The feature extractor must produce exactly what the encoder
    /// consumes: `num_mel_bins` rows and `2 × max_source_positions` frames.
    pub fn check_features(&self, n_mels: usize, n_frames: usize) -> Result<(), ConfigError> {
        if n_mels != self.num_mel_bins {
            return Err(ConfigError::MelBinMismatch { extractor: n_mels, model: self.num_mel_bins });
        }
        let positions = n_frames.div_ceil(2);
        if positions != self.max_source_positions {
            return Err(ConfigError::FeatureLengthMismatch {
                frames: n_frames,
                positions,
                max_positions: self.max_source_positions,
            });
        }
        Ok(())
    }

    /// The tokenizer must agree with the model on the decoder start
    /// and end-of-text tokens, and fit inside the embedding table.
    pub fn check_tokenizer(&self, tokenizer: &WhisperTokenizer) -> Result<(), ConfigError> {
        if tokenizer.sot_id() != self.decoder_start_token_id {
            return Err(ConfigError::TokenMismatch {
                token:     START_OF_TRANSCRIPT,
                tokenizer: tokenizer.sot_id(),
                model:     self.decoder_start_token_id,
            });
        }
        if tokenizer.eot_id() != self.eos_token_id {
            return Err(ConfigError::TokenMismatch {
                token:     END_OF_TEXT,
                tokenizer: tokenizer.eot_id(),
                model:     self.eos_token_id,
            });
        }
        if tokenizer.vocab_size() > self.vocab_size {
            return Err(ConfigError::VocabularyTooLarge { tokenizer: tokenizer.vocab_size(), model: self.vocab_size });
        }
        Ok(())
    }
}

/// Decoding constraints applied during generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    pub decoder_start_token_id: u32,
    pub eos_token_id:           u32,
    /// (position, token) pairs forced regardless of the logits
    pub forced_decoder_ids:     Vec<(usize, u32)>,
    /// Never generated
    pub suppress_tokens:        Vec<u32>,
    /// Not generated at the first free position
    pub begin_suppress_tokens:  Vec<u32>,
}

impl GenerationConfig {
    pub fn from_model_config(cfg: &WhisperConfig) -> Self {
        Self {
            decoder_start_token_id: cfg.decoder_start_token_id,
            eos_token_id:           cfg.eos_token_id,
            forced_decoder_ids:     cfg.forced_decoder_ids.clone().unwrap_or_default(),
            suppress_tokens:        cfg.suppress_tokens.clone(),
            begin_suppress_tokens:  cfg.begin_suppress_tokens.clone(),
        }
    }

    /// Drop the forced prompt and the suppression list so generation
    /// follows the fine-tuned model instead of the base model's defaults.
    pub fn without_forced_decoding(self) -> Self {
        Self {
            forced_decoder_ids: Vec::new(),
            suppress_tokens: Vec::new(),
            ..self
        }
    }
}

// ─── Building blocks ──────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct Norm<B: Backend> {
    pub weight:  Param<Tensor<B, 1>>,
    pub bias:    Param<Tensor<B, 1>>,
    pub epsilon: f64,
}

impl<B: Backend> Norm<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let (var, mean) = x.clone().var_mean_bias(D - 1);
        let x = x.sub(mean).div(var.add_scalar(self.epsilon).sqrt());
        x.mul(self.weight.val().unsqueeze()).add(self.bias.val().unsqueeze())
    }

    fn param_count(&self) -> usize {
        2 * self.weight.dims()[0]
    }
}

#[derive(Module, Debug)]
pub struct Conv<B: Backend> {
    /// [channels_out, channels_in, kernel]
    pub weight: Param<Tensor<B, 3>>,
    pub bias:   Param<Tensor<B, 1>>,
    pub stride: usize,
}

impl<B: Backend> Conv<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let options = ConvOptions::new([self.stride], [1], [1], 1);
        conv1d(x, self.weight.val(), Some(self.bias.val()), options)
    }

    fn param_count(&self) -> usize {
        self.weight.shape().num_elements() + self.bias.dims()[0]
    }
}

#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub q_proj:   AdaptedLinear<B>,
    pub k_proj:   AdaptedLinear<B>,
    pub v_proj:   AdaptedLinear<B>,
    pub out_proj: AdaptedLinear<B>,
    pub n_heads:  usize,
}

impl<B: Backend> Attention<B> {
    /// x: [B, Tq, D]; `context` is the key/value source for
    /// cross-attention (self-attention when None).
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>, causal: bool) -> Tensor<B, 3> {
        let [batch, t_q, d_model] = x.dims();
        let head_dim = d_model / self.n_heads;
        let source = context.unwrap_or_else(|| x.clone());
        let t_k = source.dims()[1];

        let split = |t: Tensor<B, 3>, len: usize| {
            t.reshape([batch, len, self.n_heads, head_dim]).swap_dims(1, 2)
        };

        let scale = (head_dim as f64).powf(-0.5);
        let q = split(self.q_proj.forward(x).mul_scalar(scale), t_q);
        let k = split(self.k_proj.forward(source.clone()), t_k);
        let v = split(self.v_proj.forward(source), t_k);

        // [B, H, Tq, Tk]
        let mut scores = q.matmul(k.swap_dims(2, 3));
        if causal {
            let device = scores.device();
            scores = scores + causal_mask::<B>(t_q, t_k, &device).reshape([1, 1, t_q, t_k]);
        }
        let weights = softmax(scores, 3);

        let out = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, t_q, d_model]);
        self.out_proj.forward(out)
    }

    /// Projections by their HuggingFace names.
    pub fn projections_mut(&mut self) -> [(&'static str, &mut AdaptedLinear<B>); 4] {
        [
            ("q_proj", &mut self.q_proj),
            ("k_proj", &mut self.k_proj),
            ("v_proj", &mut self.v_proj),
            ("out_proj", &mut self.out_proj),
        ]
    }

    fn projections(&self) -> [&AdaptedLinear<B>; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj]
    }
}

/// Additive mask: 0 on and below the diagonal, a large negative value above.
fn causal_mask<B: Backend>(t_q: usize, t_k: usize, device: &B::Device) -> Tensor<B, 2> {
    let offset = t_k.saturating_sub(t_q);
    let values: Vec<f32> = (0..t_q)
        .flat_map(|i| (0..t_k).map(move |j| if j > i + offset { -1e9 } else { 0.0 }))
        .collect();
    Tensor::from_data(TensorData::new(values, [t_q, t_k]), device)
}

#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub fc1: AdaptedLinear<B>,
    pub fc2: AdaptedLinear<B>,
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(gelu(self.fc1.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    pub self_attn:            Attention<B>,
    pub self_attn_layer_norm: Norm<B>,
    pub mlp:                  Mlp<B>,
    pub final_layer_norm:     Norm<B>,
}

impl<B: Backend> EncoderLayer<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = self.self_attn.forward(self.self_attn_layer_norm.forward(x.clone()), None, false);
        let x = x + h;
        let h = self.mlp.forward(self.final_layer_norm.forward(x.clone()));
        x + h
    }
}

#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    pub self_attn:               Attention<B>,
    pub self_attn_layer_norm:    Norm<B>,
    pub encoder_attn:            Attention<B>,
    pub encoder_attn_layer_norm: Norm<B>,
    pub mlp:                     Mlp<B>,
    pub final_layer_norm:        Norm<B>,
}

impl<B: Backend> DecoderLayer<B> {
    pub fn forward(&self, x: Tensor<B, 3>, encoder_out: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = self.self_attn.forward(self.self_attn_layer_norm.forward(x.clone()), None, true);
        let x = x + h;
        let h = self.encoder_attn.forward(
            self.encoder_attn_layer_norm.forward(x.clone()),
            Some(encoder_out),
            false,
        );
        let x = x + h;
        let h = self.mlp.forward(self.final_layer_norm.forward(x.clone()));
        x + h
    }
}

// ─── Model ────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct WhisperModel<B: Backend> {
    pub conv1:                   Conv<B>,
    pub conv2:                   Conv<B>,
    pub encoder_positions:       Param<Tensor<B, 2>>,
    pub encoder_layers:          Vec<EncoderLayer<B>>,
    pub encoder_layer_norm:      Norm<B>,
    pub embed_tokens:            Param<Tensor<B, 2>>,
    pub decoder_positions:       Param<Tensor<B, 2>>,
    pub decoder_layers:          Vec<DecoderLayer<B>>,
    pub decoder_layer_norm:      Norm<B>,
    pub decoder_start_token_id:  u32,
    pub pad_token_id:            u32,
}

/// The trainable part of a WhisperModel: every attached LoRA adapter,
/// in a fixed traversal order. This is what intermediate checkpoints
/// persist.
#[derive(Module, Debug)]
pub struct AdapterWeights<B: Backend> {
    pub adapters: Vec<LoraAdapter<B>>,
}

impl<B: Backend> AdapterWeights<B> {
    pub fn param_count(&self) -> usize {
        self.adapters.iter().map(|a| a.param_count()).sum()
    }
}

impl<B: Backend> WhisperModel<B> {
    /// Build from a weight source; every linear layer is quantized to int8.
    pub fn load(cfg: &WhisperConfig, weights: &dyn WeightSource, device: &B::Device) -> Result<Self> {
        let loader = Loader::new(weights, device);
        let d = cfg.d_model;

        let encoder_layers = (0..cfg.encoder_layers)
            .map(|i| {
                let p = format!("encoder.layers.{i}");
                Ok(EncoderLayer {
                    self_attn:            loader.attention(&format!("{p}.self_attn"), d, cfg.encoder_attention_heads)?,
                    self_attn_layer_norm: loader.norm(&format!("{p}.self_attn_layer_norm"), d)?,
                    mlp:                  loader.mlp(&p, d, cfg.encoder_ffn_dim)?,
                    final_layer_norm:     loader.norm(&format!("{p}.final_layer_norm"), d)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let decoder_layers = (0..cfg.decoder_layers)
            .map(|i| {
                let p = format!("decoder.layers.{i}");
                Ok(DecoderLayer {
                    self_attn:               loader.attention(&format!("{p}.self_attn"), d, cfg.decoder_attention_heads)?,
                    self_attn_layer_norm:    loader.norm(&format!("{p}.self_attn_layer_norm"), d)?,
                    encoder_attn:            loader.attention(&format!("{p}.encoder_attn"), d, cfg.decoder_attention_heads)?,
                    encoder_attn_layer_norm: loader.norm(&format!("{p}.encoder_attn_layer_norm"), d)?,
                    mlp:                     loader.mlp(&p, d, cfg.decoder_ffn_dim)?,
                    final_layer_norm:        loader.norm(&format!("{p}.final_layer_norm"), d)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            conv1:                  loader.conv("encoder.conv1", d, cfg.num_mel_bins, 1)?,
            conv2:                  loader.conv("encoder.conv2", d, d, 2)?,
            encoder_positions:      loader.param2("encoder.embed_positions.weight", [cfg.max_source_positions, d])?,
            encoder_layers,
            encoder_layer_norm:     loader.norm("encoder.layer_norm", d)?,
            embed_tokens:           loader.param2("decoder.embed_tokens.weight", [cfg.vocab_size, d])?,
            decoder_positions:      loader.param2("decoder.embed_positions.weight", [cfg.max_target_positions, d])?,
            decoder_layers,
            decoder_layer_norm:     loader.norm("decoder.layer_norm", d)?,
            decoder_start_token_id: cfg.decoder_start_token_id,
            pad_token_id:           cfg.pad_token_id,
        })
    }

    /// input_features: [B, n_mels, n_frames] → [B, n_frames / 2, d_model]
    pub fn encode(&self, input_features: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = gelu(self.conv1.forward(input_features));
        let x = gelu(self.conv2.forward(x)).swap_dims(1, 2);
        let [_, t, d] = x.dims();

        let positions = self.encoder_positions.val().slice([0..t, 0..d]);
        let mut x = x + positions.unsqueeze();
        for layer in &self.encoder_layers {
            x = layer.forward(x);
        }
        self.encoder_layer_norm.forward(x)
    }

    /// decoder_input_ids: [B, T] → logits [B, T, vocab]
    pub fn decode(&self, decoder_input_ids: Tensor<B, 2, Int>, encoder_out: Tensor<B, 3>) -> Tensor<B, 3> {
        let [_, t] = decoder_input_ids.dims();
        let d = self.embed_tokens.dims()[1];

        let tokens = embedding(self.embed_tokens.val(), decoder_input_ids);
        let positions = self.decoder_positions.val().slice([0..t, 0..d]);
        let mut x = tokens + positions.unsqueeze();
        for layer in &self.decoder_layers {
            x = layer.forward(x, encoder_out.clone());
        }
        let x = self.decoder_layer_norm.forward(x);
        x.matmul(self.embed_tokens.val().transpose().unsqueeze())
    }

    pub fn forward(&self, input_features: Tensor<B, 3>, decoder_input_ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let encoder_out = self.encode(input_features);
        self.decode(decoder_input_ids, encoder_out)
    }

    /// Decoder inputs are the labels shifted one step right behind the
    /// start token, with ignored positions replaced by the pad token.
    pub fn shift_right(&self, labels: Tensor<B, 2, Int>) -> Tensor<B, 2, Int> {
        let [batch, len] = labels.dims();
        let device = labels.device();

        let start = Tensor::<B, 2, Int>::full([batch, 1], self.decoder_start_token_id as i64, &device);
        if len <= 1 {
            return start;
        }
        let body = labels.slice([0..batch, 0..len - 1]);
        let body = body.clone().mask_fill(body.equal_elem(IGNORE_INDEX), self.pad_token_id as i64);
        Tensor::cat(vec![start, body], 1)
    }

    /// Mean token-level cross-entropy over positions whose label is not
    /// IGNORE_INDEX. Returns the loss and the logits.
    pub fn forward_loss(&self, input_features: Tensor<B, 3>, labels: Tensor<B, 2, Int>) -> (Tensor<B, 1>, Tensor<B, 3>) {
        let decoder_input_ids = self.shift_right(labels.clone());
        let logits = self.forward(input_features, decoder_input_ids);
        let [batch, len, _] = logits.dims();

        let ignored = labels.clone().equal_elem(IGNORE_INDEX);
        let mask = ignored.clone().bool_not().float();
        let targets = labels.mask_fill(ignored, 0).reshape([batch, len, 1]);

        let log_probs = log_softmax(logits.clone(), 2);
        let nll = log_probs.gather(2, targets).reshape([batch, len]).neg();

        let count = mask.clone().sum().clamp_min(1.0);
        let loss = (nll * mask).sum() / count;
        (loss, logits)
    }

    /// Greedy decoding from the start token, honouring the generation
    /// constraints, up to `max_length` tokens (prompt included).
    /// Returns one token sequence per batch row, without the start token.
    pub fn greedy_decode(&self, input_features: Tensor<B, 3>, generation: &GenerationConfig, max_length: usize) -> Result<Vec<Vec<u32>>> {
        let [batch, _, _] = input_features.dims();
        let device = input_features.device();
        let encoder_out = self.encode(input_features);
        let max_length = max_length.min(self.decoder_positions.dims()[0]);

        let mut sequences = vec![vec![generation.decoder_start_token_id]; batch];
        let mut finished = vec![false; batch];

        while sequences[0].len() < max_length && finished.iter().any(|f| !f) {
            let step = sequences[0].len();
            let flat: Vec<i64> = sequences.iter().flatten().map(|&t| t as i64).collect();
            let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(flat, [batch, step]), &device);

            let logits = self.decode(ids, encoder_out.clone());
            let vocab = logits.dims()[2];
            let last: Vec<f32> = logits
                .slice([0..batch, step - 1..step, 0..vocab])
                .into_data()
                .convert::<f32>()
                .to_vec()
                .map_err(|e| anyhow::anyhow!("Cannot read logits: {e:?}"))?;

            let forced = generation
                .forced_decoder_ids
                .iter()
                .find(|(pos, _)| *pos == step)
                .map(|(_, tok)| *tok);
            let first_free = step == 1 + generation.forced_decoder_ids.len();

            for (row, seq) in sequences.iter_mut().enumerate() {
                let next = if finished[row] {
                    generation.eos_token_id
                } else if let Some(tok) = forced {
                    tok
                } else {
                    let row_logits = &last[row * vocab..(row + 1) * vocab];
                    argmax_allowed(row_logits, |tok| {
                        !generation.suppress_tokens.contains(&tok)
                            && !(first_free && generation.begin_suppress_tokens.contains(&tok))
                    })
                };
                if next == generation.eos_token_id {
                    finished[row] = true;
                }
                seq.push(next);
            }
        }

        Ok(sequences.into_iter().map(|s| s[1..].to_vec()).collect())
    }

    // ── Adapter access ────────────────────────────────────────────────────────

    fn attentions(&self) -> Vec<&Attention<B>> {
        let mut out: Vec<&Attention<B>> = self.encoder_layers.iter().map(|l| &l.self_attn).collect();
        for layer in &self.decoder_layers {
            out.push(&layer.self_attn);
            out.push(&layer.encoder_attn);
        }
        out
    }

    fn attentions_mut(&mut self) -> Vec<&mut Attention<B>> {
        let mut out: Vec<&mut Attention<B>> = self.encoder_layers.iter_mut().map(|l| &mut l.self_attn).collect();
        for layer in self.decoder_layers.iter_mut() {
            out.push(&mut layer.self_attn);
            out.push(&mut layer.encoder_attn);
        }
        out
    }

    /// Attach a fresh adapter to every targeted attention projection.
    /// Returns how many projections were adapted.
    pub fn attach_lora(&mut self, config: &LoraConfig, device: &B::Device) -> usize {
        let mut attached = 0;
        for attention in self.attentions_mut() {
            for (name, proj) in attention.projections_mut() {
                if config.targets(name) {
                    proj.attach(config, device);
                    attached += 1;
                }
            }
        }
        attached
    }

    /// Clone out every attached adapter.
    pub fn adapter(&self) -> AdapterWeights<B> {
        let adapters = self
            .attentions()
            .into_iter()
            .flat_map(|a| a.projections())
            .filter_map(|p| p.lora.clone())
            .collect();
        AdapterWeights { adapters }
    }

    /// Replace the attached adapters, in the order `adapter()` yields them.
    pub fn with_adapter(mut self, weights: AdapterWeights<B>) -> Result<Self> {
        let expected = self.adapter().adapters.len();
        if weights.adapters.len() != expected {
            bail!(
                "Adapter has {} LoRA blocks but the model has {} adapted projections",
                weights.adapters.len(),
                expected
            );
        }

        let mut incoming = weights.adapters.into_iter();
        for attention in self.attentions_mut() {
            for (_, proj) in attention.projections_mut() {
                if proj.lora.is_some() {
                    proj.lora = incoming.next();
                }
            }
        }
        Ok(self)
    }

    /// Every weight of the model, counting int8 values once each.
    pub fn param_count(&self) -> usize {
        let linear = |p: &AdaptedLinear<B>| {
            p.base.param_count() + p.lora.as_ref().map(|l| l.param_count()).unwrap_or(0)
        };
        let attention = |a: &Attention<B>| a.projections().into_iter().map(linear).sum::<usize>();
        let mlp = |m: &Mlp<B>| linear(&m.fc1) + linear(&m.fc2);

        let encoder: usize = self
            .encoder_layers
            .iter()
            .map(|l| attention(&l.self_attn) + mlp(&l.mlp) + l.self_attn_layer_norm.param_count() + l.final_layer_norm.param_count())
            .sum();
        let decoder: usize = self
            .decoder_layers
            .iter()
            .map(|l| {
                attention(&l.self_attn)
                    + attention(&l.encoder_attn)
                    + mlp(&l.mlp)
                    + l.self_attn_layer_norm.param_count()
                    + l.encoder_attn_layer_norm.param_count()
                    + l.final_layer_norm.param_count()
            })
            .sum();

        self.conv1.param_count()
            + self.conv2.param_count()
            + self.encoder_positions.shape().num_elements()
            + self.encoder_layer_norm.param_count()
            + encoder
            + self.embed_tokens.shape().num_elements()
            + self.decoder_positions.shape().num_elements()
            + self.decoder_layer_norm.param_count()
            + decoder
    }
}

fn argmax_allowed(logits: &[f32], allowed: impl Fn(u32) -> bool) -> u32 {
    logits
        .iter()
        .enumerate()
        .filter(|(i, _)| allowed(*i as u32))
        .fold((0u32, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i as u32, v) } else { best })
        .0
}

/// Scalar loss value on the host.
pub fn loss_value<B: Backend>(loss: Tensor<B, 1>) -> f64 {
    loss.into_scalar().elem::<f64>()
}

// ─── Weight loading ───────────────────────────────────────────────────────────

/// Resolves HuggingFace tensor names (with or without the `model.`
/// prefix) and turns host data into parameters.
struct Loader<'a, B: Backend> {
    source: &'a dyn WeightSource,
    device: &'a B::Device,
}

impl<'a, B: Backend> Loader<'a, B> {
    fn new(source: &'a dyn WeightSource, device: &'a B::Device) -> Self {
        Self { source, device }
    }

    fn get(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>> {
        let prefixed = format!("model.{name}");
        if self.source.contains(&prefixed) {
            self.source.tensor(&prefixed, shape)
        } else {
            self.source.tensor(name, shape)
        }
    }

    fn param1(&self, name: &str, len: usize) -> Result<Param<Tensor<B, 1>>> {
        let data = self.get(name, &[len])?;
        Ok(Param::from_tensor(Tensor::from_data(TensorData::new(data, [len]), self.device)))
    }

    fn param2(&self, name: &str, shape: [usize; 2]) -> Result<Param<Tensor<B, 2>>> {
        let data = self.get(name, &shape)?;
        Ok(Param::from_tensor(Tensor::from_data(TensorData::new(data, shape), self.device)))
    }

    fn norm(&self, prefix: &str, d: usize) -> Result<Norm<B>> {
        Ok(Norm {
            weight:  self.param1(&format!("{prefix}.weight"), d)?,
            bias:    self.param1(&format!("{prefix}.bias"), d)?,
            epsilon: LAYER_NORM_EPS,
        })
    }

    fn conv(&self, prefix: &str, c_out: usize, c_in: usize, stride: usize) -> Result<Conv<B>> {
        let shape = [c_out, c_in, 3];
        let data = self.get(&format!("{prefix}.weight"), &shape)?;
        Ok(Conv {
            weight: Param::from_tensor(Tensor::from_data(TensorData::new(data, shape), self.device)),
            bias:   self.param1(&format!("{prefix}.bias"), c_out)?,
            stride,
        })
    }

    fn linear(&self, prefix: &str, d_in: usize, d_out: usize, bias: bool) -> Result<AdaptedLinear<B>> {
        let weight = self.get(&format!("{prefix}.weight"), &[d_out, d_in])?;
        let bias = if bias { Some(self.get(&format!("{prefix}.bias"), &[d_out])?) } else { None };
        Ok(AdaptedLinear::new(QuantizedLinear::from_pytorch(&weight, d_out, d_in, bias, self.device)))
    }

    fn attention(&self, prefix: &str, d: usize, n_heads: usize) -> Result<Attention<B>> {
        if d % n_heads != 0 {
            bail!("d_model {d} is not divisible by {n_heads} heads");
        }
        Ok(Attention {
            q_proj:   self.linear(&format!("{prefix}.q_proj"), d, d, true)?,
            k_proj:   self.linear(&format!("{prefix}.k_proj"), d, d, false)?,
            v_proj:   self.linear(&format!("{prefix}.v_proj"), d, d, true)?,
            out_proj: self.linear(&format!("{prefix}.out_proj"), d, d, true)?,
            n_heads,
        })
    }

    fn mlp(&self, prefix: &str, d: usize, ffn: usize) -> Result<Mlp<B>> {
        Ok(Mlp {
            fc1: self.linear(&format!("{prefix}.fc1"), d, ffn, true)?,
            fc2: self.linear(&format!("{prefix}.fc2"), ffn, d, true)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::weights::RandomWeights;
    use crate::test_support::tiny_whisper_config;
    use burn::backend::NdArray;

    type B = NdArray;

    fn tiny_model() -> WhisperModel<B> {
        WhisperModel::load(&tiny_whisper_config(), &RandomWeights::new(3), &Default::default()).unwrap()
    }

    fn features(batch: usize) -> Tensor<B, 3> {
        Tensor::random([batch, 8, 100], burn::tensor::Distribution::Default, &Default::default())
    }

    #[test]
    fn test_config_parses_hf_json() {
        let json = r#"{
            "vocab_size": 51865, "num_mel_bins": 80, "d_model": 384,
            "encoder_layers": 4, "encoder_attention_heads": 6, "encoder_ffn_dim": 1536,
            "decoder_layers": 4, "decoder_attention_heads": 6, "decoder_ffn_dim": 1536,
            "max_source_positions": 1500, "max_target_positions": 448,
            "decoder_start_token_id": 50258, "pad_token_id": 50257, "eos_token_id": 50257,
            "forced_decoder_ids": [[1, 50259], [2, 50359], [3, 50363]],
            "suppress_tokens": [1, 2, 7],
            "activation_function": "gelu"
        }"#;
        let cfg: WhisperConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.forced_decoder_ids.as_ref().map(|f| f.len()), Some(3));
        assert!(cfg.begin_suppress_tokens.is_empty());
        assert!(cfg.check_features(80, 3000).is_ok());
        assert_eq!(
            cfg.check_features(80, 1000),
            Err(ConfigError::FeatureLengthMismatch { frames: 1000, positions: 500, max_positions: 1500 })
        );
        assert_eq!(cfg.check_features(128, 3000), Err(ConfigError::MelBinMismatch { extractor: 128, model: 80 }));
    }

    #[test]
    fn test_check_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::test_support::write_test_tokenizer(dir.path());
        let tokenizer = WhisperTokenizer::from_file(&path, crate::domain::task::Task::Transcribe, None).unwrap();

        let cfg = tiny_whisper_config();
        assert!(cfg.check_tokenizer(&tokenizer).is_ok());

        let shifted = WhisperConfig { decoder_start_token_id: 4, ..tiny_whisper_config() };
        assert_eq!(
            shifted.check_tokenizer(&tokenizer),
            Err(ConfigError::TokenMismatch { token: START_OF_TRANSCRIPT, tokenizer: 1, model: 4 })
        );

        let small = WhisperConfig { vocab_size: 10, ..tiny_whisper_config() };
        assert_eq!(
            small.check_tokenizer(&tokenizer),
            Err(ConfigError::VocabularyTooLarge { tokenizer: 20, model: 10 })
        );
    }

    #[test]
    fn test_generation_config_disables_forced_ids() {
        let gen = GenerationConfig::from_model_config(&tiny_whisper_config());
        assert_eq!(gen.forced_decoder_ids.len(), 2);
        let gen = gen.without_forced_decoding();
        assert!(gen.forced_decoder_ids.is_empty());
        assert!(gen.suppress_tokens.is_empty());
        assert_eq!(gen.begin_suppress_tokens, vec![0]);
    }

    #[test]
    fn test_forward_shapes() {
        let model = tiny_model();
        let enc = model.encode(features(2));
        assert_eq!(enc.dims(), [2, 50, 16]);

        let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![1i64, 5, 6, 1, 5, 8], [2, 3]), &Default::default());
        let logits = model.decode(ids, enc);
        assert_eq!(logits.dims(), [2, 3, 20]);
    }

    #[test]
    fn test_decoder_does_not_see_future_tokens() {
        let model = tiny_model();
        let device = Default::default();
        let enc = model.encode(features(1));

        let a = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![1i64, 5, 6, 9], [1, 4]), &device);
        let b = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![1i64, 5, 12, 3], [1, 4]), &device);
        let first_two = |ids| -> Vec<f32> {
            model.decode(ids, enc.clone()).slice([0..1, 0..2, 0..20]).into_data().to_vec().unwrap()
        };

        for (x, y) in first_two(a).iter().zip(first_two(b).iter()) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn test_shift_right_replaces_ignored() {
        let model = tiny_model();
        let labels = Tensor::<B, 2, Int>::from_data(
            TensorData::new(vec![5i64, 6, 0, -100, 5, 6, 9, 0], [2, 4]),
            &Default::default(),
        );
        let shifted: Vec<i64> = model.shift_right(labels).into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(shifted, vec![1, 5, 6, 0, 1, 5, 6, 9]);
    }

    #[test]
    fn test_loss_ignores_padding() {
        let model = tiny_model();
        let device = Default::default();
        let feats = features(1);

        let short = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![5i64, 6, 0], [1, 3]), &device);
        let padded = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![5i64, 6, 0, -100, -100], [1, 5]), &device);

        let (a, _) = model.forward_loss(feats.clone(), short);
        let (b, _) = model.forward_loss(feats, padded);
        let (a, b) = (loss_value(a), loss_value(b));
        assert!(a.is_finite() && a > 0.0);
        assert!((a - b).abs() < 1e-4, "{a} vs {b}");
    }

    #[test]
    fn test_attach_lora_targets_q_and_v_everywhere() {
        let mut model = tiny_model();
        let before = model.param_count();
        assert!(model.adapter().adapters.is_empty());

        let cfg = LoraConfig { r: 4, ..LoraConfig::default() };
        // encoder self-attn + decoder self-attn + decoder cross-attn, q and v each
        assert_eq!(model.attach_lora(&cfg, &Default::default()), 6);

        let adapter = model.adapter();
        assert_eq!(adapter.adapters.len(), 6);
        assert_eq!(adapter.param_count(), 6 * (16 * 4 + 4 * 16));
        assert_eq!(model.param_count(), before + adapter.param_count());
    }

    #[test]
    fn test_with_adapter_checks_count() {
        let mut model = tiny_model();
        model.attach_lora(&LoraConfig { r: 2, ..LoraConfig::default() }, &Default::default());
        let adapter = model.adapter();
        let model = model.with_adapter(adapter).unwrap();

        let empty = AdapterWeights::<B> { adapters: Vec::new() };
        assert!(model.with_adapter(empty).is_err());
    }

    #[test]
    fn test_greedy_decode_respects_bounds_and_suppression() {
        let model = tiny_model();
        let gen = GenerationConfig::from_model_config(&tiny_whisper_config());
        let out = model.greedy_decode(features(2), &gen, 6).unwrap();

        assert_eq!(out.len(), 2);
        for seq in &out {
            assert!(seq.len() <= 5);
            // forced prompt
            assert_eq!(&seq[..2], &[2, 5]);
            assert!(!seq.contains(&7));
        }
    }

    #[test]
    fn test_argmax_allowed() {
        assert_eq!(argmax_allowed(&[0.1, 0.9, 0.5], |_| true), 1);
        assert_eq!(argmax_allowed(&[0.1, 0.9, 0.5], |t| t != 1), 2);
    }
}
