//! TF-Locoformer: dual-path time-frequency transformer
//!
//! Input is a complex spectrogram `[B, T, F, 2]` (re/im). Each cell is
//! projected 2 → H, passed through the blocks, and projected H → 2·S. The
//! output is `[B, T, F·2·S]`, laid out per time step as
//! `[f0_s0_re, f0_s0_im, f0_s1_re, …, f1_s0_re, …]`.

mod block;

pub use block::LocoformerBlock;

use std::sync::Arc;

use loco_dsp::ComplexSpectrogram;
use ndarray::{Array3, Array4, ArrayView1, ArrayView2, ArrayView3, Axis, Ix1, Ix2, Ix3};

use crate::config::ModelConfig;
use crate::error::{MlError, MlResult};
use crate::primitives::{Linear, RotaryEmbedding};
use crate::weights::{ModelWeights, Tensor};

pub struct TfLocoformer {
    config: ModelConfig,
    input_proj: Linear,
    blocks: Vec<LocoformerBlock>,
    output_proj: Linear,
}

impl TfLocoformer {
    pub fn new(config: ModelConfig) -> MlResult<Self> {
        config.validate()?;

        let rotary = if config.use_rotary_embedding {
            Some(Arc::new(RotaryEmbedding::new(
                config.head_dim(),
                config.max_seq_len,
                config.rotary_base,
            )?))
        } else {
            None
        };

        let blocks = (0..config.num_layers)
            .map(|i| LocoformerBlock::new(i, &config, rotary.clone()))
            .collect::<MlResult<Vec<_>>>()?;

        Ok(Self {
            input_proj: Linear::new("input_proj", 2, config.hidden_dim),
            output_proj: Linear::new("output_proj", config.hidden_dim, config.output_dim()),
            blocks,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Validate against the config, then load every layer
    pub fn load_weights(&mut self, weights: &ModelWeights) -> MlResult<()> {
        weights.validate(&self.config)?;

        self.input_proj
            .load_weights(view2(&weights.input_proj.weight)?, view1(&weights.input_proj.bias)?)?;
        for (block, block_weights) in self.blocks.iter_mut().zip(&weights.blocks) {
            block.load_weights(block_weights)?;
        }
        self.output_proj
            .load_weights(view2(&weights.output_proj.weight)?, view1(&weights.output_proj.bias)?)?;

        log::debug!(
            "Loaded {} parameters into TF-Locoformer ({} layers)",
            weights.parameter_count(),
            self.config.num_layers
        );
        Ok(())
    }

    /// `[B, T, F, 2] -> [B, T, F·2·S]`
    pub fn forward(&self, input: &Array4<f32>) -> MlResult<Array3<f32>> {
        let (b, t, f, c) = input.dim();
        if c != 2 || f != self.config.num_freq_bins {
            return Err(MlError::shape(
                format!("[B, T, {}, 2]", self.config.num_freq_bins),
                format!("{:?}", input.shape()),
            ));
        }
        let hidden = self.config.hidden_dim;
        let cells = b * t * f;

        let rows = input.to_shape((cells, 2)).map_err(reshape_error)?;
        let mut x = self
            .input_proj
            .forward(rows.view())?
            .into_shape_with_order((b, t, f, hidden))
            .map_err(reshape_error)?;

        for block in &self.blocks {
            x = block.forward(x)?;
        }

        let rows = x.into_shape_with_order((cells, hidden)).map_err(reshape_error)?;
        self.output_proj
            .forward(rows.view())?
            .into_shape_with_order((b, t, f * self.config.output_dim()))
            .map_err(reshape_error)
    }

    /// Separate one spectrogram into one spectrogram per configured stem
    pub fn separate(&self, spec: &ComplexSpectrogram) -> MlResult<Vec<ComplexSpectrogram>> {
        let input = spectrogram_to_input(spec);
        let output = self.forward(&input)?;
        split_stems(output.index_axis(Axis(0), 0), spec.freq_bins(), self.config.num_stems)
    }
}

/// `ComplexSpectrogram` (bin-major) to model input `[1, T, F, 2]`
pub fn spectrogram_to_input(spec: &ComplexSpectrogram) -> Array4<f32> {
    let (bins, frames) = (spec.freq_bins(), spec.num_frames());
    let (real, imag) = (spec.real(), spec.imag());
    Array4::from_shape_fn((1, frames, bins, 2), |(_, t, f, part)| {
        let idx = f * frames + t;
        if part == 0 { real[idx] } else { imag[idx] }
    })
}

/// De-interleave `[T, F·2·S]` model output into `S` spectrograms
pub fn split_stems(
    output: ArrayView2<f32>,
    freq_bins: usize,
    num_stems: usize,
) -> MlResult<Vec<ComplexSpectrogram>> {
    let (frames, width) = output.dim();
    if width != freq_bins * 2 * num_stems {
        return Err(MlError::shape(
            format!("{} values per frame", freq_bins * 2 * num_stems),
            format!("{width}"),
        ));
    }

    let mut stems = Vec::with_capacity(num_stems);
    for stem in 0..num_stems {
        let mut real = vec![0.0f32; freq_bins * frames];
        let mut imag = vec![0.0f32; freq_bins * frames];
        for (t, row) in output.axis_iter(Axis(0)).enumerate() {
            for f in 0..freq_bins {
                let base = (f * num_stems + stem) * 2;
                real[f * frames + t] = row[base];
                imag[f * frames + t] = row[base + 1];
            }
        }
        stems.push(ComplexSpectrogram::from_parts(real, imag, freq_bins, frames)?);
    }
    Ok(stems)
}

fn reshape_error(e: ndarray::ShapeError) -> MlError {
    MlError::shape("contiguous tensor", e.to_string())
}

fn tensor_error(expected: &str, tensor: &Tensor, e: ndarray::ShapeError) -> MlError {
    MlError::shape(format!("{expected} tensor"), format!("{:?} ({e})", tensor.shape()))
}

pub(crate) fn view1(tensor: &Tensor) -> MlResult<ArrayView1<'_, f32>> {
    tensor
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| tensor_error("1-D", tensor, e))
}

pub(crate) fn view2(tensor: &Tensor) -> MlResult<ArrayView2<'_, f32>> {
    tensor
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| tensor_error("2-D", tensor, e))
}

pub(crate) fn view3(tensor: &Tensor) -> MlResult<ArrayView3<'_, f32>> {
    tensor
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| tensor_error("3-D", tensor, e))
}
