//! Rotary position embedding (rotate-half layout)

use ndarray::{Array2, ArrayViewMut2, Axis};

use crate::error::{MlError, MlResult};

/// Precomputed cos/sin tables of shape `[max_seq_len, dim/2]`
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    dim: usize,
    max_seq_len: usize,
    cos: Array2<f32>,
    sin: Array2<f32>,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, max_seq_len: usize, base: f32) -> MlResult<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(MlError::Config(format!(
                "rotary dim must be even and non-zero, got {dim}"
            )));
        }

        let half = dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / dim as f32))
            .collect();

        let mut cos = Array2::<f32>::zeros((max_seq_len, half));
        let mut sin = Array2::<f32>::zeros((max_seq_len, half));
        for pos in 0..max_seq_len {
            for (i, &freq) in inv_freq.iter().enumerate() {
                let (s, c) = (pos as f32 * freq).sin_cos();
                cos[[pos, i]] = c;
                sin[[pos, i]] = s;
            }
        }

        Ok(Self {
            dim,
            max_seq_len,
            cos,
            sin,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Rotate `(x[i], x[i + dim/2])` pairs of a `[seq, dim]` block in place
    pub fn apply(&self, mut x: ArrayViewMut2<f32>) -> MlResult<()> {
        let (seq, dim) = x.dim();
        if dim != self.dim {
            return Err(MlError::shape(format!("rotary dim {}", self.dim), format!("{dim}")));
        }
        if seq > self.max_seq_len {
            return Err(MlError::PositionOverflow {
                len: seq,
                max: self.max_seq_len,
            });
        }

        let half = self.dim / 2;
        for (pos, mut row) in x.axis_iter_mut(Axis(0)).enumerate() {
            for i in 0..half {
                let (c, s) = (self.cos[[pos, i]], self.sin[[pos, i]]);
                let a = row[i];
                let b = row[i + half];
                row[i] = a * c - b * s;
                row[i + half] = a * s + b * c;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_odd_dim_rejected() {
        assert!(matches!(RotaryEmbedding::new(7, 16, 10000.0), Err(MlError::Config(_))));
    }

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, 8, 10000.0).unwrap();
        let mut x = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        rope.apply(x.view_mut()).unwrap();
        assert_eq!(x.row(0).to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_preserves_pair_norm() {
        let rope = RotaryEmbedding::new(8, 32, 10000.0).unwrap();
        let mut x = Array2::from_shape_fn((20, 8), |(p, i)| ((p * 8 + i) as f32 * 0.37).sin());
        let before = x.clone();
        rope.apply(x.view_mut()).unwrap();

        for pos in 0..20 {
            for i in 0..4 {
                let n0 = before[[pos, i]].hypot(before[[pos, i + 4]]);
                let n1 = x[[pos, i]].hypot(x[[pos, i + 4]]);
                assert_abs_diff_eq!(n0, n1, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_first_pair_rotates_by_position() {
        let rope = RotaryEmbedding::new(2, 4, 10000.0).unwrap();
        let mut x = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 1.0, 0.0]).unwrap();
        rope.apply(x.view_mut()).unwrap();
        // frequency 1 for i = 0, position 1 rotates by one radian
        assert_abs_diff_eq!(x[[1, 0]], 1.0f32.cos(), epsilon = 1e-6);
        assert_abs_diff_eq!(x[[1, 1]], 1.0f32.sin(), epsilon = 1e-6);
    }

    #[test]
    fn test_overflow_is_error() {
        let rope = RotaryEmbedding::new(4, 3, 10000.0).unwrap();
        let mut x = Array2::<f32>::zeros((4, 4));
        assert!(matches!(
            rope.apply(x.view_mut()),
            Err(MlError::PositionOverflow { len: 4, max: 3 })
        ));
    }
}
