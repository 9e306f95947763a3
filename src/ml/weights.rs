// ============================================================
// Layer 5 — Weight Sources
// ============================================================
// The model builders ask a WeightSource for every tensor by its
// HuggingFace name and PyTorch shape, e.g.
//
//   model.encoder.layers.0.self_attn.q_proj.weight   [d_model, d_model]
//
// Two sources exist:
//   SafetensorsWeights — a pretrained `model.safetensors`
//   RandomWeights      — seeded init, for fresh models and tests
//
// Values come back as host f32 data; the builders decide how to
// lay them out (transpose, quantize) before creating tensors.

use anyhow::{bail, Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use safetensors::{Dtype, SafeTensors};
use std::path::{Path, PathBuf};

pub trait WeightSource {
    /// Fetch `name` as f32 values in row-major order; `shape` is
    /// the expected PyTorch layout and is checked.
    fn tensor(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>>;

    fn contains(&self, name: &str) -> bool;
}

// ─── Safetensors ──────────────────────────────────────────────────────────────

pub struct SafetensorsWeights {
    path:  PathBuf,
    bytes: Vec<u8>,
}

impl SafetensorsWeights {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Cannot read weights '{}'", path.display()))?;
        // Parse once up front so a corrupt file fails at load time
        let count = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("'{}' is not a safetensors file", path.display()))?
            .len();
        tracing::info!("Opened '{}' ({} tensors)", path.display(), count);
        Ok(Self { path: path.to_path_buf(), bytes })
    }
}

impl WeightSource for SafetensorsWeights {
    fn tensor(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>> {
        let st = SafeTensors::deserialize(&self.bytes)?;
        let view = st
            .tensor(name)
            .with_context(|| format!("Tensor '{}' not found in '{}'", name, self.path.display()))?;

        if view.shape() != shape {
            bail!(
                "Tensor '{}' has shape {:?}, expected {:?}",
                name,
                view.shape(),
                shape
            );
        }
        to_f32(view.dtype(), view.data()).with_context(|| format!("Tensor '{name}'"))
    }

    fn contains(&self, name: &str) -> bool {
        SafeTensors::deserialize(&self.bytes)
            .map(|st| st.tensor(name).is_ok())
            .unwrap_or(false)
    }
}

fn to_f32(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        other => bail!("unsupported dtype {other:?}"),
    };
    Ok(values)
}

// ─── Random init ──────────────────────────────────────────────────────────────

/// Seeded initialisation: norm scales are 1, biases 0, everything
/// else uniform in ±`scale`. The same name always gets the same values.
pub struct RandomWeights {
    seed:  u64,
    scale: f32,
}

impl RandomWeights {
    pub fn new(seed: u64) -> Self {
        Self { seed, scale: 0.05 }
    }
}

impl WeightSource for RandomWeights {
    fn tensor(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>> {
        let numel: usize = shape.iter().product();
        if name.ends_with("layer_norm.weight") {
            return Ok(vec![1.0; numel]);
        }
        if name.ends_with(".bias") {
            return Ok(vec![0.0; numel]);
        }

        let mut rng = StdRng::seed_from_u64(self.seed ^ fnv1a(name));
        Ok((0..numel).map(|_| rng.gen_range(-self.scale..self.scale)).collect())
    }

    fn contains(&self, _name: &str) -> bool {
        true
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;
    use std::collections::HashMap;

    #[test]
    fn test_random_is_deterministic_per_name() {
        let w = RandomWeights::new(7);
        let a = w.tensor("x.weight", &[4, 4]).unwrap();
        let b = w.tensor("x.weight", &[4, 4]).unwrap();
        let c = w.tensor("y.weight", &[4, 4]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(w.tensor("n.layer_norm.weight", &[3]).unwrap(), vec![1.0; 3]);
        assert_eq!(w.tensor("fc1.bias", &[2]).unwrap(), vec![0.0; 2]);
    }

    #[test]
    fn test_safetensors_f16_and_shape_check() {
        let values: Vec<u8> = [1.0f32, -2.0, 0.5, 4.0]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::F16, vec![2, 2], &values).unwrap();
        let mut map = HashMap::new();
        map.insert("w".to_string(), view);
        let bytes = safetensors::serialize(&map, &None).unwrap();

        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, bytes).unwrap();

        let w = SafetensorsWeights::open(&path).unwrap();
        assert!(w.contains("w"));
        assert!(!w.contains("missing"));
        assert_eq!(w.tensor("w", &[2, 2]).unwrap(), vec![1.0, -2.0, 0.5, 4.0]);
        assert!(w.tensor("w", &[4]).is_err());
    }
}
