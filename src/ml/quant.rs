// ============================================================
// Layer 5 — 8-bit Quantized Linear
// ============================================================
// Base linear layers are stored as int8 values plus one f32 scale
// per output channel (absmax quantization):
//
//   scale[o] = max_i |W[o, i]| / 127
//   q[o, i]  = round(W[o, i] / scale[o])   ∈ [-127, 127]
//
// Four int8 values share one 32-bit Int element, so the weights
// take one byte per value on backends with i32 integers (wgpu,
// NdArray<f32, i32>):
//
//   packed = (q0 + 128) + (q1 + 128)·2^8 + (q2 + 128)·2^16 + q3·2^24
//
// The low three bytes are offset to be positive and the top byte
// keeps its sign, so every packed value fits an i32 exactly.
//
// The forward pass unpacks on the device and dequantizes the layer
// for the duration of one matmul:
//
//   y = x · (q ⊙ scale) + bias
//
// Quantized weights never receive gradients; they are frozen
// together with the rest of the base model. Burn's own quantized
// tensors are not usable here because the autodiff backend does
// not implement dequantization.
//
// Reference: Dettmers et al. (2022) LLM.int8()

use burn::{
    module::{Param, ParamId},
    prelude::*,
    tensor::TensorData,
};

const QMAX: f32 = 127.0;

/// int8 values per packed Int element.
pub const PACK: usize = 4;

const BYTE: i64 = 1 << 8;
const LOW: i64 = 1 << 24;

/// A row-major `[rows, cols]` matrix quantized per row.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix {
    pub values: Vec<i8>,
    pub scales: Vec<f32>,
    pub rows:   usize,
    pub cols:   usize,
}

impl QuantizedMatrix {
    /// The same values laid out as `[cols, rows]`.
    pub fn transposed_values(&self) -> Vec<i8> {
        let mut out = vec![0i8; self.values.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                out[c * self.rows + r] = self.values[r * self.cols + c];
            }
        }
        out
    }
}

/// Absmax-quantize each row of a `[rows, cols]` matrix to int8.
/// An all-zero row gets scale 1 so dequantization stays exact.
pub fn quantize_absmax(weight: &[f32], rows: usize, cols: usize) -> QuantizedMatrix {
    let mut values = Vec::with_capacity(weight.len());
    let mut scales = Vec::with_capacity(rows);

    for row in weight.chunks_exact(cols) {
        let absmax = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let scale = if absmax > 0.0 { absmax / QMAX } else { 1.0 };
        values.extend(row.iter().map(|v| (v / scale).round().clamp(-QMAX, QMAX) as i8));
        scales.push(scale);
    }
    QuantizedMatrix { values, scales, rows, cols }
}

/// Pack each row of a `[rows, cols]` int8 matrix, four values per
/// element. Rows are padded with zeros to a multiple of four.
/// Returns the packed row-major matrix and its width.
pub fn pack_int8(values: &[i8], rows: usize, cols: usize) -> (Vec<i32>, usize) {
    let width = cols.div_ceil(PACK);
    let mut packed = Vec::with_capacity(rows * width);
    for row in values.chunks_exact(cols) {
        for group in 0..width {
            let q = |k: usize| row.get(group * PACK + k).copied().unwrap_or(0) as i32;
            packed.push((q(0) + 128) + ((q(1) + 128) << 8) + ((q(2) + 128) << 16) + (q(3) << 24));
        }
    }
    (packed, width)
}

/// Device-side inverse of `pack_int8`: `[rows, width]` → `[rows, cols]`.
fn unpack_int8<B: Backend>(packed: Tensor<B, 2, Int>, cols: usize) -> Tensor<B, 2, Int> {
    let [rows, width] = packed.dims();

    // remainder may follow the sign of the dividend; fold it into [0, 2^24)
    let low = packed.clone().remainder_scalar(LOW);
    let low = low.clone().mask_where(low.clone().lower_elem(0), low.add_scalar(LOW));
    let top = (packed - low.clone()).div_scalar(LOW);

    let byte = |shift: i64| low.clone().div_scalar(shift).remainder_scalar(BYTE).sub_scalar(128);
    let bytes = vec![byte(1), byte(BYTE), byte(BYTE * BYTE), top];

    Tensor::stack::<3>(bytes, 2)
        .reshape([rows, width * PACK])
        .slice([0..rows, 0..cols])
}

#[derive(Module, Debug)]
pub struct QuantizedLinear<B: Backend> {
    /// [d_input, ceil(d_output / 4)], packed int8
    pub weight:   Param<Tensor<B, 2, Int>>,
    /// [1, d_output]
    pub scale:    Param<Tensor<B, 2>>,
    pub bias:     Option<Param<Tensor<B, 1>>>,
    pub d_output: usize,
}

impl<B: Backend> QuantizedLinear<B> {
    /// Quantize a PyTorch-layout weight `[d_output, d_input]`.
    pub fn from_pytorch(
        weight: &[f32],
        d_output: usize,
        d_input:  usize,
        bias:     Option<Vec<f32>>,
        device:   &B::Device,
    ) -> Self {
        let q = quantize_absmax(weight, d_output, d_input);

        // stored transposed so forward is a plain matmul
        let (packed, width) = pack_int8(&q.transposed_values(), d_input, d_output);
        let weight = Tensor::<B, 2, Int>::from_data(TensorData::new(packed, [d_input, width]), device);
        let scale = Tensor::<B, 2>::from_data(TensorData::new(q.scales, [1, d_output]), device);
        let bias = bias.map(|b| {
            Param::from_tensor(Tensor::<B, 1>::from_data(TensorData::new(b, [d_output]), device))
        });

        Self {
            weight: Param::initialized(ParamId::new(), weight),
            scale:  Param::from_tensor(scale),
            bias,
            d_output,
        }
    }

    pub fn d_input(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn d_output(&self) -> usize {
        self.d_output
    }

    /// Number of weights the layer represents (bias included, scales not).
    pub fn param_count(&self) -> usize {
        self.d_input() * self.d_output + self.bias.as_ref().map(|_| self.d_output).unwrap_or(0)
    }

    /// `[d_input, d_output]` int8 values, unpacked on the device.
    pub fn int8_weight(&self) -> Tensor<B, 2, Int> {
        unpack_int8(self.weight.val(), self.d_output)
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let weight = self.int8_weight().float() * self.scale.val();
        let output = input.matmul(weight.unsqueeze());
        match &self.bias {
            Some(bias) => output + bias.val().unsqueeze(),
            None => output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn test_quantize_absmax_range_and_error() {
        let w = [0.5, -1.0, 0.25, 0.0, 0.0, 0.0];
        let q = quantize_absmax(&w, 2, 3);

        assert_eq!(q.values[1], -127);
        assert!(q.values.iter().all(|v| (-127..=127).contains(v)));
        // zero row keeps an exact round trip
        assert_eq!(q.scales[1], 1.0);

        for (i, (&v, &a)) in q.values.iter().zip(w.iter()).enumerate() {
            let back = v as f32 * q.scales[i / 3];
            assert!((a - back).abs() <= 1.0 / 127.0, "{a} vs {back}");
        }
    }

    #[test]
    fn test_unpack_recovers_extremes_and_padding() {
        // odd width forces a padded group; extremes hit both ends of the top byte
        let values: Vec<i8> = vec![-127, 127, 0, -127, 5, 127, -1, 1, 0, -64, 64];
        let (packed, width) = pack_int8(&values, 1, values.len());
        assert_eq!(width, 3);

        let device = Default::default();
        let tensor = Tensor::<B, 2, Int>::from_data(TensorData::new(packed, [1, width]), &device);
        let unpacked: Vec<i64> = unpack_int8(tensor, values.len())
            .into_data()
            .convert::<i64>()
            .to_vec()
            .unwrap();
        let expected: Vec<i64> = values.iter().map(|&v| v as i64).collect();
        assert_eq!(unpacked, expected);
    }

    #[test]
    fn test_weights_take_one_byte_per_value() {
        type I32Backend = NdArray<f32, i32>;
        let device = Default::default();
        let w: Vec<f32> = (0..64 * 64).map(|i| ((i % 255) as f32 - 127.0) / 100.0).collect();
        let layer = QuantizedLinear::<I32Backend>::from_pytorch(&w, 64, 64, None, &device);

        let stored = layer.weight.val().into_data();
        assert!(stored.as_bytes().len() <= 64 * 64, "{} bytes", stored.as_bytes().len());
        assert_eq!(layer.int8_weight().dims(), [64, 64]);
    }

    #[test]
    fn test_forward_matches_float_linear() {
        let device = Default::default();
        // W: [out=2, in=3]
        let w = [1.0, 0.0, -1.0, 0.5, 0.5, 0.5];
        let layer = QuantizedLinear::<B>::from_pytorch(&w, 2, 3, Some(vec![0.1, -0.1]), &device);
        assert_eq!(layer.d_input(), 3);
        assert_eq!(layer.d_output(), 2);
        assert_eq!(layer.param_count(), 8);

        let x = Tensor::<B, 2>::from_data(TensorData::new(vec![1.0f32, 2.0, 3.0], [1, 3]), &device);
        let y: Vec<f32> = layer.forward(x).into_data().to_vec().unwrap();

        // exact: [1 - 3 + 0.1, 3 - 0.1]
        assert!((y[0] - -1.9).abs() < 0.05);
        assert!((y[1] - 2.9).abs() < 0.05);
    }
}
