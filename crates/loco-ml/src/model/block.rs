//! Dual-path TF-Locoformer block

use std::sync::Arc;

use ndarray::{Array3, Array4, ArrayView3, Axis};

use super::{view1, view2, view3};
use crate::config::{AttentionMode, ModelConfig};
use crate::error::{MlError, MlResult};
use crate::primitives::{ConvSwiGLU, MultiHeadAttention, Projection, RmsGroupNorm, RotaryEmbedding};
use crate::weights::{AttentionWeights, BlockWeights, NormWeights};

/// norm → time attention → residual, norm → frequency attention → residual,
/// norm → ConvSwiGLU along time → residual. Input and output are `[B, T, F, H]`.
#[derive(Debug, Clone)]
pub struct LocoformerBlock {
    mode: AttentionMode,
    time_norm: RmsGroupNorm,
    time_attn: MultiHeadAttention,
    freq_norm: RmsGroupNorm,
    freq_attn: MultiHeadAttention,
    ffn_norm: RmsGroupNorm,
    ffn: ConvSwiGLU,
}

impl LocoformerBlock {
    pub fn new(index: usize, config: &ModelConfig, rotary: Option<Arc<RotaryEmbedding>>) -> MlResult<Self> {
        let hidden = config.hidden_dim;
        let prefix = format!("blocks.{index}");
        let norm = || RmsGroupNorm::new(hidden, config.norm_groups, config.norm_eps);

        Ok(Self {
            mode: config.attention_mode,
            time_norm: norm()?,
            time_attn: MultiHeadAttention::new(
                &format!("{prefix}.time_attn"),
                hidden,
                config.num_heads,
                rotary.clone(),
            )?,
            freq_norm: norm()?,
            freq_attn: MultiHeadAttention::new(
                &format!("{prefix}.freq_attn"),
                hidden,
                config.num_heads,
                rotary,
            )?,
            ffn_norm: norm()?,
            ffn: ConvSwiGLU::new(
                &format!("{prefix}.ffn"),
                hidden,
                config.ffn_dim(),
                config.ffn_kernel_size,
            )?,
        })
    }

    pub fn load_weights(&mut self, weights: &BlockWeights) -> MlResult<()> {
        load_norm(&mut self.time_norm, &weights.time_norm)?;
        load_attention(&mut self.time_attn, &weights.time_attn)?;
        load_norm(&mut self.freq_norm, &weights.freq_norm)?;
        load_attention(&mut self.freq_attn, &weights.freq_attn)?;
        load_norm(&mut self.ffn_norm, &weights.ffn_norm)?;

        let ffn = &weights.ffn;
        self.ffn.load_conv1(view3(&ffn.conv1.weight)?, view1(&ffn.conv1.bias)?)?;
        self.ffn.load_gate(view3(&ffn.gate.weight)?, view1(&ffn.gate.bias)?)?;
        self.ffn.load_conv2(view3(&ffn.conv2.weight)?, view1(&ffn.conv2.bias)?)?;
        Ok(())
    }

    pub fn forward(&self, mut x: Array4<f32>) -> MlResult<Array4<f32>> {
        if self.mode.has_time() {
            let normed = self.time_norm.forward_tf(&x)?;
            x += &along_time(&normed, |seqs| self.time_attn.forward_batch(seqs))?;
        }

        if self.mode.has_frequency() {
            let normed = self.freq_norm.forward_tf(&x)?;
            x += &along_freq(&normed, |seqs| self.freq_attn.forward_batch(seqs))?;
        }

        let normed = self.ffn_norm.forward_tf(&x)?;
        x += &along_time(&normed, |seqs| {
            let mut out = Array3::<f32>::zeros(seqs.dim());
            for (seq, mut dst) in seqs.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
                dst.assign(&self.ffn.forward(seq)?);
            }
            Ok(out)
        })?;

        Ok(x)
    }
}

fn load_norm(norm: &mut RmsGroupNorm, weights: &NormWeights) -> MlResult<()> {
    norm.load_weights(view1(&weights.gamma)?, view1(&weights.beta)?)
}

fn load_attention(attn: &mut MultiHeadAttention, weights: &AttentionWeights) -> MlResult<()> {
    for (which, layer) in [
        (Projection::Query, &weights.q),
        (Projection::Key, &weights.k),
        (Projection::Value, &weights.v),
        (Projection::Output, &weights.out),
    ] {
        attn.load_projection(which, view2(&layer.weight)?, view1(&layer.bias)?)?;
    }
    Ok(())
}

/// Run `op` over time sequences, with `(B·F)` as the batch axis
fn along_time<F>(x: &Array4<f32>, op: F) -> MlResult<Array4<f32>>
where
    F: Fn(ArrayView3<f32>) -> MlResult<Array3<f32>>,
{
    let (b, t, f, h) = x.dim();
    let seqs = x
        .view()
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((b * f, t, h))
        .map_err(reshape_error)?;

    let out = op(seqs.view())?
        .into_shape_with_order((b, f, t, h))
        .map_err(reshape_error)?;
    Ok(out.permuted_axes([0, 2, 1, 3]).as_standard_layout().into_owned())
}

/// Run `op` over frequency sequences, with `(B·T)` as the batch axis
fn along_freq<F>(x: &Array4<f32>, op: F) -> MlResult<Array4<f32>>
where
    F: Fn(ArrayView3<f32>) -> MlResult<Array3<f32>>,
{
    let (b, t, f, h) = x.dim();
    let seqs = x.to_shape((b * t, f, h)).map_err(reshape_error)?;
    op(seqs.view())?
        .into_shape_with_order((b, t, f, h))
        .map_err(reshape_error)
}

fn reshape_error(e: ndarray::ShapeError) -> MlError {
    MlError::shape("contiguous [B, T, F, H] tensor", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelVariant;
    use crate::weights::ModelWeights;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn tiny(mode: AttentionMode) -> ModelConfig {
        ModelConfig {
            num_freq_bins: 5,
            hidden_dim: 8,
            num_heads: 2,
            num_layers: 1,
            ffn_multiplier: 2,
            ffn_kernel_size: 3,
            norm_groups: 2,
            max_seq_len: 32,
            attention_mode: mode,
            ..ModelConfig::base()
        }
    }

    fn block(config: &ModelConfig) -> LocoformerBlock {
        let rope = Arc::new(RotaryEmbedding::new(config.head_dim(), config.max_seq_len, 10000.0).unwrap());
        let mut block = LocoformerBlock::new(0, config, Some(rope)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let weights = ModelWeights::random(ModelVariant::TwoStem, "t", config, &mut rng, 0.3);
        block.load_weights(&weights.blocks[0]).unwrap();
        block
    }

    fn input(b: usize, t: usize, f: usize, h: usize) -> Array4<f32> {
        Array4::from_shape_fn((b, t, f, h), |(i, j, k, l)| ((i * 7 + j * 5 + k * 3 + l) as f32 * 0.13).sin())
    }

    #[test]
    fn test_shape_preserved_all_modes() {
        for mode in [AttentionMode::Time, AttentionMode::Frequency, AttentionMode::Dual] {
            let config = tiny(mode);
            let out = block(&config).forward(input(2, 6, 5, 8)).unwrap();
            assert_eq!(out.dim(), (2, 6, 5, 8));
            assert!(out.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_batch_items_independent() {
        let config = tiny(AttentionMode::Dual);
        let block = block(&config);
        let x = input(2, 4, 5, 8);
        let both = block.forward(x.clone()).unwrap();

        // group norm statistics are per batch item, so item 1 alone matches
        let second = x.index_axis(Axis(0), 1).insert_axis(Axis(0)).to_owned();
        let alone = block.forward(second).unwrap();
        for (a, b) in both.index_axis(Axis(0), 1).iter().zip(alone.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_unloaded_block_fails() {
        let config = tiny(AttentionMode::Dual);
        let block = LocoformerBlock::new(0, &config, None).unwrap();
        assert!(matches!(
            block.forward(input(1, 2, 5, 8)),
            Err(MlError::WeightsNotLoaded { .. })
        ));
    }
}
