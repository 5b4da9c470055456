//! RMS group normalization

use ndarray::{Array1, Array3, Array4, ArrayView1, ArrayView3, Axis};

use crate::error::{MlError, MlResult};

/// Group-wise RMS normalization with per-channel affine.
///
/// Channels split into `groups` equal slices; each slice is scaled by
/// `1 / sqrt(mean(x²) + eps)` over its channel×spatial extent, per batch item.
#[derive(Debug, Clone)]
pub struct RmsGroupNorm {
    channels: usize,
    groups: usize,
    eps: f32,
    gamma: Array1<f32>,
    beta: Array1<f32>,
}

impl RmsGroupNorm {
    pub fn new(channels: usize, groups: usize, eps: f32) -> MlResult<Self> {
        if groups == 0 || channels % groups != 0 {
            return Err(MlError::Config(format!(
                "{channels} channels cannot be split into {groups} groups"
            )));
        }
        Ok(Self {
            channels,
            groups,
            eps,
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn load_weights(&mut self, gamma: ArrayView1<f32>, beta: ArrayView1<f32>) -> MlResult<()> {
        if gamma.len() != self.channels || beta.len() != self.channels {
            return Err(MlError::shape(
                format!("gamma/beta of {}", self.channels),
                format!("gamma {}, beta {}", gamma.len(), beta.len()),
            ));
        }
        self.gamma.assign(&gamma);
        self.beta.assign(&beta);
        Ok(())
    }

    /// Normalize `[batch, channels, spatial]`
    pub fn forward_channels_first(&self, x: ArrayView3<f32>) -> MlResult<Array3<f32>> {
        self.check_channels(x.len_of(Axis(1)))?;
        Ok(self.normalize(x))
    }

    /// Normalize `[batch, spatial, channels]`
    pub fn forward_channels_last(&self, x: ArrayView3<f32>) -> MlResult<Array3<f32>> {
        self.check_channels(x.len_of(Axis(2)))?;
        let out = self.normalize(x.permuted_axes([0, 2, 1]));
        Ok(out.permuted_axes([0, 2, 1]).as_standard_layout().into_owned())
    }

    /// Normalize `[batch, time, freq, channels]` with time×freq as the spatial extent
    pub fn forward_tf(&self, x: &Array4<f32>) -> MlResult<Array4<f32>> {
        let (b, t, f, c) = x.dim();
        let flat = x
            .to_shape((b, t * f, c))
            .map_err(|e| MlError::shape(format!("[{b}, {}, {c}]", t * f), e.to_string()))?;
        let out = self.forward_channels_last(flat.view())?;
        out.into_shape_with_order((b, t, f, c))
            .map_err(|e| MlError::shape(format!("[{b}, {t}, {f}, {c}]"), e.to_string()))
    }

    fn check_channels(&self, got: usize) -> MlResult<()> {
        if got != self.channels {
            return Err(MlError::shape(
                format!("{} channels", self.channels),
                format!("{got} channels"),
            ));
        }
        Ok(())
    }

    /// Core over a `[batch, channels, spatial]` view of any layout
    fn normalize(&self, x: ArrayView3<f32>) -> Array3<f32> {
        let (batch, channels, spatial) = x.dim();
        let per_group = channels / self.groups;
        let count = (per_group * spatial).max(1) as f32;
        let mut out = Array3::<f32>::zeros((batch, channels, spatial));

        for b in 0..batch {
            for g in 0..self.groups {
                let c0 = g * per_group;
                let c1 = c0 + per_group;

                let mut sum_sq = 0.0f32;
                for c in c0..c1 {
                    for s in 0..spatial {
                        let v = x[[b, c, s]];
                        sum_sq += v * v;
                    }
                }
                let inv_rms = 1.0 / (sum_sq / count + self.eps).sqrt();

                for c in c0..c1 {
                    let (gamma, beta) = (self.gamma[c], self.beta[c]);
                    for s in 0..spatial {
                        out[[b, c, s]] = x[[b, c, s]] * inv_rms * gamma + beta;
                    }
                }
            }
        }

        out
    }
}
