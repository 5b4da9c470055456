//! Convolutional SwiGLU feed-forward

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, Axis};

use super::activation::swish;
use super::linear::Conv1d;
use crate::error::MlResult;

/// Pointwise expand → depthwise causal value/gate conv → `value · swish(gate)` → pointwise project
#[derive(Debug, Clone)]
pub struct ConvSwiGLU {
    hidden: usize,
    ffn: usize,
    conv1: Conv1d,
    gate: Conv1d,
    conv2: Conv1d,
}

impl ConvSwiGLU {
    pub fn new(name: &str, hidden: usize, ffn: usize, kernel_size: usize) -> MlResult<Self> {
        Ok(Self {
            hidden,
            ffn,
            conv1: Conv1d::new(format!("{name}.conv1"), hidden, ffn, 1, 1)?,
            gate: Conv1d::new(format!("{name}.gate"), ffn, 2 * ffn, kernel_size, ffn)?,
            conv2: Conv1d::new(format!("{name}.conv2"), ffn, hidden, 1, 1)?,
        })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn ffn(&self) -> usize {
        self.ffn
    }

    pub fn load_conv1(&mut self, weight: ArrayView3<f32>, bias: ArrayView1<f32>) -> MlResult<()> {
        self.conv1.load_weights(weight, bias)
    }

    pub fn load_gate(&mut self, weight: ArrayView3<f32>, bias: ArrayView1<f32>) -> MlResult<()> {
        self.gate.load_weights(weight, bias)
    }

    pub fn load_conv2(&mut self, weight: ArrayView3<f32>, bias: ArrayView1<f32>) -> MlResult<()> {
        self.conv2.load_weights(weight, bias)
    }

    /// `[time, hidden] -> [time, hidden]`
    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let expanded = self.conv1.forward(x.t())?;
        let gated = self.gate.forward(expanded.view())?;

        let len = gated.len_of(Axis(1));
        let mut mixed = Array2::<f32>::zeros((self.ffn, len));
        for c in 0..self.ffn {
            let value = gated.row(2 * c);
            let gate = gated.row(2 * c + 1);
            for (dst, (&v, &g)) in mixed.row_mut(c).iter_mut().zip(value.iter().zip(gate.iter())) {
                *dst = v * swish(g);
            }
        }

        let projected = self.conv2.forward(mixed.view())?;
        Ok(projected.reversed_axes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MlError;
    use ndarray::{Array1, Array3};

    fn loaded(hidden: usize, ffn: usize, kernel: usize) -> ConvSwiGLU {
        let mut layer = ConvSwiGLU::new("ffn", hidden, ffn, kernel).unwrap();
        let w1 = Array3::from_shape_fn((ffn, hidden, 1), |(o, i, _)| 0.1 * (o + i) as f32);
        let wg = Array3::from_shape_fn((2 * ffn, 1, kernel), |(o, _, k)| 0.2 + 0.05 * (o + k) as f32);
        let w2 = Array3::from_shape_fn((hidden, ffn, 1), |(o, i, _)| 0.1 - 0.02 * (o * i) as f32);
        layer.load_conv1(w1.view(), Array1::zeros(ffn).view()).unwrap();
        layer.load_gate(wg.view(), Array1::zeros(2 * ffn).view()).unwrap();
        layer.load_conv2(w2.view(), Array1::zeros(hidden).view()).unwrap();
        layer
    }

    #[test]
    fn test_unloaded_is_error() {
        let layer = ConvSwiGLU::new("ffn", 4, 8, 3).unwrap();
        let x = Array2::<f32>::zeros((5, 4));
        assert!(matches!(
            layer.forward(x.view()),
            Err(MlError::WeightsNotLoaded { .. })
        ));
    }

    #[test]
    fn test_shape_preserved() {
        let layer = loaded(4, 8, 3);
        let x = Array2::from_shape_fn((10, 4), |(t, c)| ((t + c) as f32 * 0.3).sin());
        let y = layer.forward(x.view()).unwrap();
        assert_eq!(y.dim(), (10, 4));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_causal_along_time() {
        let layer = loaded(2, 4, 3);
        let mut x = Array2::from_shape_fn((8, 2), |(t, c)| 0.1 * (t + 1) as f32 + c as f32);
        let before = layer.forward(x.view()).unwrap();

        // changing the future must not change the past
        x[[6, 0]] = 5.0;
        let after = layer.forward(x.view()).unwrap();
        for t in 0..6 {
            for c in 0..2 {
                assert_eq!(before[[t, c]], after[[t, c]]);
            }
        }
        assert_ne!(before[[6, 0]], after[[6, 0]]);
    }

    #[test]
    fn test_zero_input_zero_bias_gives_zero() {
        let layer = loaded(3, 6, 2);
        let y = layer.forward(Array2::<f32>::zeros((4, 3)).view()).unwrap();
        assert!(y.iter().all(|&v| v == 0.0));
    }
}
