//! Linear and grouped causal 1-D convolution layers

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};

use crate::error::{MlError, MlResult};

/// `y = x W^T + b` over the last axis. Weight is `[out, in]`.
#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    in_features: usize,
    out_features: usize,
    weight: Option<Array2<f32>>,
    bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
            weight: None,
            bias: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn is_loaded(&self) -> bool {
        self.weight.is_some()
    }

    pub fn load_weights(&mut self, weight: ArrayView2<f32>, bias: ArrayView1<f32>) -> MlResult<()> {
        if weight.dim() != (self.out_features, self.in_features) || bias.len() != self.out_features {
            return Err(MlError::shape(
                format!(
                    "{}: weight [{}, {}], bias [{}]",
                    self.name, self.out_features, self.in_features, self.out_features
                ),
                format!("weight {:?}, bias [{}]", weight.shape(), bias.len()),
            ));
        }
        self.weight = Some(weight.to_owned());
        self.bias = Some(bias.to_owned());
        Ok(())
    }

    /// `[rows, in] -> [rows, out]`
    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let (weight, bias) = match (&self.weight, &self.bias) {
            (Some(w), Some(b)) => (w, b),
            _ => {
                return Err(MlError::WeightsNotLoaded {
                    layer: self.name.clone(),
                });
            }
        };
        if x.ncols() != self.in_features {
            return Err(MlError::shape(
                format!("{}: {} input features", self.name, self.in_features),
                format!("{}", x.ncols()),
            ));
        }
        Ok(x.dot(&weight.t()) + bias)
    }
}

/// Grouped 1-D convolution with causal (left-only) padding.
///
/// Weight is `[out, in/groups, kernel]`; output length equals input length.
#[derive(Debug, Clone)]
pub struct Conv1d {
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    groups: usize,
    weight: Option<Array3<f32>>,
    bias: Option<Array1<f32>>,
}

impl Conv1d {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        groups: usize,
    ) -> MlResult<Self> {
        let name = name.into();
        if kernel_size == 0
            || groups == 0
            || in_channels % groups != 0
            || out_channels % groups != 0
        {
            return Err(MlError::Config(format!(
                "{name}: {in_channels} -> {out_channels} channels, kernel {kernel_size}, groups {groups}"
            )));
        }
        Ok(Self {
            name,
            in_channels,
            out_channels,
            kernel_size,
            groups,
            weight: None,
            bias: None,
        })
    }

    pub fn weight_shape(&self) -> [usize; 3] {
        [self.out_channels, self.in_channels / self.groups, self.kernel_size]
    }

    pub fn load_weights(&mut self, weight: ArrayView3<f32>, bias: ArrayView1<f32>) -> MlResult<()> {
        let expected = self.weight_shape();
        if weight.shape() != expected || bias.len() != self.out_channels {
            return Err(MlError::shape(
                format!("{}: weight {:?}, bias [{}]", self.name, expected, self.out_channels),
                format!("weight {:?}, bias [{}]", weight.shape(), bias.len()),
            ));
        }
        self.weight = Some(weight.to_owned());
        self.bias = Some(bias.to_owned());
        Ok(())
    }

    /// `[in_channels, len] -> [out_channels, len]`
    pub fn forward(&self, x: ArrayView2<f32>) -> MlResult<Array2<f32>> {
        let (weight, bias) = match (&self.weight, &self.bias) {
            (Some(w), Some(b)) => (w, b),
            _ => {
                return Err(MlError::WeightsNotLoaded {
                    layer: self.name.clone(),
                });
            }
        };
        let (channels, len) = x.dim();
        if channels != self.in_channels {
            return Err(MlError::shape(
                format!("{}: {} input channels", self.name, self.in_channels),
                format!("{channels}"),
            ));
        }

        let bias_col = bias.view().insert_axis(Axis(1));

        // Pointwise dense conv is a plain matrix product
        if self.kernel_size == 1 && self.groups == 1 {
            let w = weight.index_axis(Axis(2), 0);
            return Ok(w.dot(&x) + &bias_col);
        }

        let in_per_group = self.in_channels / self.groups;
        let out_per_group = self.out_channels / self.groups;
        let pad = self.kernel_size - 1;
        let mut out = Array2::<f32>::zeros((self.out_channels, len));

        for o in 0..self.out_channels {
            let group = o / out_per_group;
            let mut row = out.row_mut(o);
            row.fill(bias[o]);
            for ic in 0..in_per_group {
                let input = x.row(group * in_per_group + ic);
                for j in 0..self.kernel_size {
                    let w = weight[[o, ic, j]];
                    // tap j reads x[t - pad + j]
                    let shift = pad - j;
                    for t in shift..len {
                        row[t] += w * input[t - shift];
                    }
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_linear_requires_weights() {
        let layer = Linear::new("proj", 2, 3);
        let x = Array2::<f32>::zeros((4, 2));
        assert!(matches!(
            layer.forward(x.view()),
            Err(MlError::WeightsNotLoaded { .. })
        ));
    }

    #[test]
    fn test_linear_forward() {
        let mut layer = Linear::new("proj", 2, 2);
        let w = arr2(&[[1.0, 2.0], [0.0, -1.0]]);
        let b = arr1(&[0.5, 1.0]);
        layer.load_weights(w.view(), b.view()).unwrap();

        let y = layer.forward(arr2(&[[1.0, 1.0], [2.0, 0.0]]).view()).unwrap();
        assert_eq!(y, arr2(&[[3.5, 0.0], [2.5, 1.0]]));
    }

    #[test]
    fn test_linear_shape_validation() {
        let mut layer = Linear::new("proj", 2, 3);
        let w = Array2::<f32>::zeros((2, 3));
        let b = Array1::<f32>::zeros(3);
        assert!(matches!(
            layer.load_weights(w.view(), b.view()),
            Err(MlError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conv_is_causal() {
        let mut conv = Conv1d::new("conv", 1, 1, 3, 1).unwrap();
        let w = Array3::from_shape_vec((1, 1, 3), vec![0.25, 0.5, 1.0]).unwrap();
        conv.load_weights(w.view(), arr1(&[0.0]).view()).unwrap();

        // impulse at t=2 only affects t >= 2
        let x = arr2(&[[0.0, 0.0, 1.0, 0.0, 0.0, 0.0]]);
        let y = conv.forward(x.view()).unwrap();
        let row: Vec<f32> = y.row(0).to_vec();
        assert_eq!(row, vec![0.0, 0.0, 1.0, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn test_depthwise_pairs_share_input() {
        // 2 input channels -> 4 outputs, groups = 2
        let mut conv = Conv1d::new("gate", 2, 4, 1, 2).unwrap();
        assert_eq!(conv.weight_shape(), [4, 1, 1]);
        let w = Array3::from_shape_vec((4, 1, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        conv.load_weights(w.view(), Array1::zeros(4).view()).unwrap();

        let x = arr2(&[[1.0, 1.0], [10.0, 10.0]]);
        let y = conv.forward(x.view()).unwrap();
        assert_abs_diff_eq!(y[[0, 0]], 1.0);
        assert_abs_diff_eq!(y[[1, 0]], 2.0);
        assert_abs_diff_eq!(y[[2, 0]], 30.0);
        assert_abs_diff_eq!(y[[3, 0]], 40.0);
    }

    #[test]
    fn test_pointwise_matches_linear() {
        let mut conv = Conv1d::new("pw", 3, 2, 1, 1).unwrap();
        let mut linear = Linear::new("lin", 3, 2);
        let w = arr2(&[[0.1, -0.2, 0.3], [0.4, 0.5, -0.6]]);
        let b = arr1(&[0.01, -0.02]);
        conv.load_weights(w.view().insert_axis(Axis(2)), b.view()).unwrap();
        linear.load_weights(w.view(), b.view()).unwrap();

        let x = Array2::from_shape_fn((5, 3), |(t, c)| (t as f32 - c as f32) * 0.3);
        let by_conv = conv.forward(x.t()).unwrap();
        let by_linear = linear.forward(x.view()).unwrap();
        for t in 0..5 {
            for o in 0..2 {
                assert_abs_diff_eq!(by_conv[[o, t]], by_linear[[t, o]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_invalid_groups() {
        assert!(Conv1d::new("bad", 3, 4, 1, 2).is_err());
        assert!(Conv1d::new("bad", 4, 4, 0, 1).is_err());
    }
}
