//! Model parameters: tensor tree, `.tflw` blob format, LRU cache and store
//!
//! Every tensor has a dotted path name (`blocks.3.time_attn.q.weight`) and a
//! fixed shape derived from [`ModelConfig`]:
//! - Linear weights are `[out, in]`
//! - Conv weights are `[out, in/groups, kernel]`
//! - Every layer carries a bias of length `out`; norms carry `gamma`/`beta`

mod blob;
mod cache;
mod store;

pub use blob::{BLOB_EXTENSION, BLOB_MAGIC, FORMAT_VERSION, content_hash, decode, encode, read_blob, write_blob};
pub use cache::WeightCache;
pub use store::{DegradedReason, LoadedWeights, WeightKey, WeightQuality, WeightStore, placeholder};

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ModelConfig, ModelVariant};
use crate::error::{MlError, MlResult};

/// Dense f32 tensor in row-major order
pub type Tensor = ArrayD<f32>;

fn zeros(shape: &[usize]) -> Tensor {
    ArrayD::zeros(IxDyn(shape))
}

/// Weight and bias of a linear or conv layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl LayerWeights {
    fn linear(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: zeros(&[out_features, in_features]),
            bias: zeros(&[out_features]),
        }
    }

    fn conv(in_channels: usize, out_channels: usize, kernel: usize, groups: usize) -> Self {
        Self {
            weight: zeros(&[out_channels, in_channels / groups, kernel]),
            bias: zeros(&[out_channels]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormWeights {
    pub gamma: Tensor,
    pub beta: Tensor,
}

impl NormWeights {
    fn identity(channels: usize) -> Self {
        Self {
            gamma: ArrayD::ones(IxDyn(&[channels])),
            beta: zeros(&[channels]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttentionWeights {
    pub q: LayerWeights,
    pub k: LayerWeights,
    pub v: LayerWeights,
    pub out: LayerWeights,
}

impl AttentionWeights {
    fn new(hidden: usize) -> Self {
        Self {
            q: LayerWeights::linear(hidden, hidden),
            k: LayerWeights::linear(hidden, hidden),
            v: LayerWeights::linear(hidden, hidden),
            out: LayerWeights::linear(hidden, hidden),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwiGluWeights {
    pub conv1: LayerWeights,
    pub gate: LayerWeights,
    pub conv2: LayerWeights,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockWeights {
    pub time_norm: NormWeights,
    pub time_attn: AttentionWeights,
    pub freq_norm: NormWeights,
    pub freq_attn: AttentionWeights,
    pub ffn_norm: NormWeights,
    pub ffn: SwiGluWeights,
}

impl BlockWeights {
    fn new(config: &ModelConfig) -> Self {
        let hidden = config.hidden_dim;
        let ffn = config.ffn_dim();
        Self {
            time_norm: NormWeights::identity(hidden),
            time_attn: AttentionWeights::new(hidden),
            freq_norm: NormWeights::identity(hidden),
            freq_attn: AttentionWeights::new(hidden),
            ffn_norm: NormWeights::identity(hidden),
            ffn: SwiGluWeights {
                conv1: LayerWeights::conv(hidden, ffn, 1, 1),
                gate: LayerWeights::conv(ffn, 2 * ffn, config.ffn_kernel_size, ffn),
                conv2: LayerWeights::conv(ffn, hidden, 1, 1),
            },
        }
    }
}

/// Provenance recorded alongside the tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightMetadata {
    pub variant: ModelVariant,
    pub version: String,
    pub num_layers: usize,
    pub config: ModelConfig,
}

/// Full parameter tree of a TF-Locoformer
#[derive(Debug, Clone, PartialEq)]
pub struct ModelWeights {
    pub metadata: WeightMetadata,
    pub input_proj: LayerWeights,
    pub blocks: Vec<BlockWeights>,
    pub output_proj: LayerWeights,
}

/// Visits named tensors of a sub-tree
macro_rules! tensor_slots {
    ($fn_name:ident, [$($ty_ref:tt)+], [$($borrow:tt)+]) => {
        impl LayerWeights {
            fn $fn_name<'a>(self: $($ty_ref)+ Self, prefix: &str, out: &mut Vec<(String, $($ty_ref)+ Tensor)>) {
                out.push((format!("{prefix}.weight"), $($borrow)+ self.weight));
                out.push((format!("{prefix}.bias"), $($borrow)+ self.bias));
            }
        }

        impl NormWeights {
            fn $fn_name<'a>(self: $($ty_ref)+ Self, prefix: &str, out: &mut Vec<(String, $($ty_ref)+ Tensor)>) {
                out.push((format!("{prefix}.gamma"), $($borrow)+ self.gamma));
                out.push((format!("{prefix}.beta"), $($borrow)+ self.beta));
            }
        }

        impl AttentionWeights {
            fn $fn_name<'a>(self: $($ty_ref)+ Self, prefix: &str, out: &mut Vec<(String, $($ty_ref)+ Tensor)>) {
                self.q.$fn_name(&format!("{prefix}.q"), out);
                self.k.$fn_name(&format!("{prefix}.k"), out);
                self.v.$fn_name(&format!("{prefix}.v"), out);
                self.out.$fn_name(&format!("{prefix}.out"), out);
            }
        }

        impl BlockWeights {
            fn $fn_name<'a>(self: $($ty_ref)+ Self, prefix: &str, out: &mut Vec<(String, $($ty_ref)+ Tensor)>) {
                self.time_norm.$fn_name(&format!("{prefix}.time_norm"), out);
                self.time_attn.$fn_name(&format!("{prefix}.time_attn"), out);
                self.freq_norm.$fn_name(&format!("{prefix}.freq_norm"), out);
                self.freq_attn.$fn_name(&format!("{prefix}.freq_attn"), out);
                self.ffn_norm.$fn_name(&format!("{prefix}.ffn_norm"), out);
                self.ffn.conv1.$fn_name(&format!("{prefix}.ffn.conv1"), out);
                self.ffn.gate.$fn_name(&format!("{prefix}.ffn.gate"), out);
                self.ffn.conv2.$fn_name(&format!("{prefix}.ffn.conv2"), out);
            }
        }
    };
}

tensor_slots!(collect_slots, [&'a], [&]);
tensor_slots!(collect_slots_mut, [&'a mut], [&mut]);

impl ModelWeights {
    /// Correctly shaped tree with zero weights/biases and unit gammas
    pub fn zeros(variant: ModelVariant, version: &str, config: &ModelConfig) -> Self {
        Self {
            metadata: WeightMetadata {
                variant,
                version: version.to_string(),
                num_layers: config.num_layers,
                config: config.clone(),
            },
            input_proj: LayerWeights::linear(2, config.hidden_dim),
            blocks: (0..config.num_layers).map(|_| BlockWeights::new(config)).collect(),
            output_proj: LayerWeights::linear(config.hidden_dim, config.output_dim()),
        }
    }

    /// Deterministic uniform ±`scale` weights from a seeded RNG; biases stay 0, gammas 1
    pub fn random(variant: ModelVariant, version: &str, config: &ModelConfig, rng: &mut ChaCha8Rng, scale: f32) -> Self {
        let mut weights = Self::zeros(variant, version, config);
        for (name, tensor) in weights.tensors_mut() {
            if name.ends_with(".weight") {
                tensor.mapv_inplace(|_| rng.random_range(-scale..=scale));
            }
        }
        weights
    }

    /// All tensors in canonical order
    pub fn tensors(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        self.input_proj.collect_slots("input_proj", &mut out);
        for (i, block) in self.blocks.iter().enumerate() {
            block.collect_slots(&format!("blocks.{i}"), &mut out);
        }
        self.output_proj.collect_slots("output_proj", &mut out);
        out
    }

    pub fn tensors_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out = Vec::new();
        self.input_proj.collect_slots_mut("input_proj", &mut out);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.collect_slots_mut(&format!("blocks.{i}"), &mut out);
        }
        self.output_proj.collect_slots_mut("output_proj", &mut out);
        out
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors().iter().map(|(_, t)| t.len()).sum()
    }

    /// Check structure and every tensor shape against `config`
    pub fn validate(&self, config: &ModelConfig) -> MlResult<()> {
        let key = format!("{}-{}", self.metadata.variant, self.metadata.version);
        let fail = |reason: String| MlError::WeightLoad {
            key: key.clone(),
            reason,
        };

        if self.blocks.len() != self.metadata.num_layers {
            return Err(fail(format!(
                "{} blocks but metadata declares {} layers",
                self.blocks.len(),
                self.metadata.num_layers
            )));
        }
        if self.metadata.num_layers != config.num_layers || self.metadata.config != *config {
            return Err(fail("weights were built for a different model config".into()));
        }

        let reference = Self::zeros(self.metadata.variant, &self.metadata.version, config);
        let expected = reference.tensors();
        let actual = self.tensors();
        if expected.len() != actual.len() {
            return Err(fail(format!(
                "{} tensors, expected {}",
                actual.len(),
                expected.len()
            )));
        }
        for ((name, want), (_, got)) in expected.iter().zip(actual.iter()) {
            if want.shape() != got.shape() {
                return Err(fail(format!(
                    "{name}: shape {:?}, expected {:?}",
                    got.shape(),
                    want.shape()
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 over tensor names and little-endian values, hex encoded
    pub fn tensor_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, tensor) in self.tensors() {
            hasher.update(name.as_bytes());
            for v in tensor.iter() {
                hasher.update(v.to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny() -> ModelConfig {
        ModelConfig {
            num_freq_bins: 9,
            hidden_dim: 8,
            num_heads: 2,
            num_layers: 2,
            ffn_multiplier: 2,
            ffn_kernel_size: 3,
            norm_groups: 2,
            max_seq_len: 64,
            ..ModelConfig::base()
        }
    }

    #[test]
    fn test_tensor_names_and_shapes() {
        let weights = ModelWeights::zeros(ModelVariant::TwoStem, "v1", &tiny());
        let tensors = weights.tensors();

        // input + output proj (2 each) and per block: 3 norms (2) + 8 attn linears (2) + 3 convs (2)
        assert_eq!(tensors.len(), 4 + 2 * (6 + 16 + 6));

        let lookup = |n: &str| tensors.iter().find(|(name, _)| name == n).map(|(_, t)| t.shape().to_vec());
        assert_eq!(lookup("input_proj.weight"), Some(vec![8, 2]));
        assert_eq!(lookup("output_proj.weight"), Some(vec![4, 8]));
        assert_eq!(lookup("blocks.1.time_attn.q.weight"), Some(vec![8, 8]));
        assert_eq!(lookup("blocks.0.ffn.conv1.weight"), Some(vec![16, 8, 1]));
        assert_eq!(lookup("blocks.0.ffn.gate.weight"), Some(vec![32, 1, 3]));
        assert_eq!(lookup("blocks.0.ffn.conv2.weight"), Some(vec![8, 16, 1]));
        assert_eq!(lookup("blocks.0.freq_norm.gamma"), Some(vec![8]));
    }

    #[test]
    fn test_validate_catches_layer_count() {
        let config = tiny();
        let mut weights = ModelWeights::zeros(ModelVariant::TwoStem, "v1", &config);
        assert!(weights.validate(&config).is_ok());

        weights.blocks.pop();
        assert!(matches!(weights.validate(&config), Err(MlError::WeightLoad { .. })));
    }

    #[test]
    fn test_validate_catches_shape() {
        let config = tiny();
        let mut weights = ModelWeights::zeros(ModelVariant::TwoStem, "v1", &config);
        weights.blocks[0].freq_attn.k.bias = zeros(&[7]);
        assert!(weights.validate(&config).is_err());
    }

    #[test]
    fn test_random_is_seeded_and_bounded() {
        let config = tiny();
        let a = ModelWeights::random(ModelVariant::TwoStem, "v1", &config, &mut ChaCha8Rng::seed_from_u64(7), 0.02);
        let b = ModelWeights::random(ModelVariant::TwoStem, "v1", &config, &mut ChaCha8Rng::seed_from_u64(7), 0.02);
        assert_eq!(a, b);
        assert_eq!(a.tensor_hash(), b.tensor_hash());

        for (name, tensor) in a.tensors() {
            if name.ends_with(".bias") || name.ends_with(".beta") {
                assert!(tensor.iter().all(|&v| v == 0.0), "{name}");
            } else if name.ends_with(".gamma") {
                assert!(tensor.iter().all(|&v| v == 1.0), "{name}");
            } else {
                assert!(tensor.iter().all(|&v| v.abs() <= 0.02), "{name}");
                assert!(tensor.iter().any(|&v| v != 0.0), "{name}");
            }
        }
    }
}
