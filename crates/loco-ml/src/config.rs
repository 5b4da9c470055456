//! Model, tier and engine configuration

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use loco_dsp::TransformConfig;
use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};

/// Environment variable that overrides [`EngineConfig::weights_dir`]
pub const WEIGHTS_DIR_ENV: &str = "LOCOFORMER_WEIGHTS_DIR";

/// Separated source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemKind {
    /// Lead and backing vocals
    Vocals,
    /// Everything except vocals (2-stem model)
    Instrumental,
    Drums,
    Bass,
    /// Melodic and harmonic instruments
    Instruments,
    /// Effects, ambience and residual content
    Fx,
}

impl StemKind {
    /// Stable lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            StemKind::Vocals => "vocals",
            StemKind::Instrumental => "instrumental",
            StemKind::Drums => "drums",
            StemKind::Bass => "bass",
            StemKind::Instruments => "instruments",
            StemKind::Fx => "fx",
        }
    }

    /// Free-tier stem set
    pub fn two_stem() -> Vec<StemKind> {
        vec![StemKind::Vocals, StemKind::Instrumental]
    }

    /// Pro-tier stem set
    pub fn five_stem() -> Vec<StemKind> {
        vec![
            StemKind::Vocals,
            StemKind::Drums,
            StemKind::Bass,
            StemKind::Instruments,
            StemKind::Fx,
        ]
    }
}

impl fmt::Display for StemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StemKind {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vocals" => Ok(StemKind::Vocals),
            "instrumental" => Ok(StemKind::Instrumental),
            "drums" => Ok(StemKind::Drums),
            "bass" => Ok(StemKind::Bass),
            "instruments" => Ok(StemKind::Instruments),
            "fx" => Ok(StemKind::Fx),
            other => Err(MlError::Config(format!("unknown stem '{other}'"))),
        }
    }
}

/// Trained model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "2stem")]
    TwoStem,
    #[serde(rename = "5stem")]
    FiveStem,
}

impl ModelVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::TwoStem => "2stem",
            ModelVariant::FiveStem => "5stem",
        }
    }

    pub fn stems(&self) -> Vec<StemKind> {
        match self {
            ModelVariant::TwoStem => StemKind::two_stem(),
            ModelVariant::FiveStem => StemKind::five_stem(),
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Service tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// 2 stems, CPU only
    Free,
    /// 5 stems, GPU when available
    Pro,
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
        }
    }

    pub fn variant(&self) -> ModelVariant {
        match self {
            Tier::Free => ModelVariant::TwoStem,
            Tier::Pro => ModelVariant::FiveStem,
        }
    }

    pub fn stems(&self) -> Vec<StemKind> {
        self.variant().stems()
    }

    /// Whether this tier may run on a GPU
    pub fn allows_gpu(&self) -> bool {
        match self {
            Tier::Free => false,
            Tier::Pro => true,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which axes a block attends over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionMode {
    Time,
    Frequency,
    #[default]
    Dual,
}

impl AttentionMode {
    pub fn has_time(&self) -> bool {
        matches!(self, AttentionMode::Time | AttentionMode::Dual)
    }

    pub fn has_frequency(&self) -> bool {
        matches!(self, AttentionMode::Frequency | AttentionMode::Dual)
    }
}

/// TF-Locoformer architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Frequency axis length (n_fft/2 + 1)
    pub num_freq_bins: usize,
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    /// ConvSwiGLU inner width = hidden_dim * ffn_multiplier
    pub ffn_multiplier: usize,
    /// Causal depthwise gate kernel
    pub ffn_kernel_size: usize,
    pub norm_groups: usize,
    pub norm_eps: f32,
    pub use_rotary_embedding: bool,
    pub rotary_base: f32,
    /// Rotary table length (longest attended axis)
    pub max_seq_len: usize,
    pub attention_mode: AttentionMode,
    pub num_stems: usize,
    pub stem_names: Vec<StemKind>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_freq_bins: 1025,
            hidden_dim: 128,
            num_heads: 4,
            num_layers: 6,
            ffn_multiplier: 4,
            ffn_kernel_size: 4,
            norm_groups: 4,
            norm_eps: 1e-5,
            use_rotary_embedding: true,
            rotary_base: 10000.0,
            max_seq_len: 4096,
            attention_mode: AttentionMode::Dual,
            num_stems: 2,
            stem_names: StemKind::two_stem(),
        }
    }
}

impl ModelConfig {
    /// Free-tier architecture
    pub fn base() -> Self {
        Self::default()
    }

    /// Pro-tier architecture: base with five stems
    pub fn five_stem() -> Self {
        Self::base().with_stems(StemKind::five_stem())
    }

    /// Same architecture, different stem set
    pub fn with_stems(mut self, stems: Vec<StemKind>) -> Self {
        self.num_stems = stems.len();
        self.stem_names = stems;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads
    }

    pub fn ffn_dim(&self) -> usize {
        self.hidden_dim * self.ffn_multiplier
    }

    /// Output projection width (re/im per stem)
    pub fn output_dim(&self) -> usize {
        2 * self.num_stems
    }

    pub fn validate(&self) -> MlResult<()> {
        let sizes = [
            ("num_freq_bins", self.num_freq_bins),
            ("hidden_dim", self.hidden_dim),
            ("num_heads", self.num_heads),
            ("num_layers", self.num_layers),
            ("ffn_multiplier", self.ffn_multiplier),
            ("ffn_kernel_size", self.ffn_kernel_size),
            ("norm_groups", self.norm_groups),
            ("max_seq_len", self.max_seq_len),
            ("num_stems", self.num_stems),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(MlError::Config(format!("{name} must be non-zero")));
        }
        if self.hidden_dim % self.num_heads != 0 {
            return Err(MlError::Config(format!(
                "hidden_dim {} not divisible by num_heads {}",
                self.hidden_dim, self.num_heads
            )));
        }
        if self.hidden_dim % self.norm_groups != 0 {
            return Err(MlError::Config(format!(
                "hidden_dim {} not divisible by norm_groups {}",
                self.hidden_dim, self.norm_groups
            )));
        }
        if self.stem_names.len() != self.num_stems {
            return Err(MlError::Config(format!(
                "{} stem names for {} stems",
                self.stem_names.len(),
                self.num_stems
            )));
        }
        if self.use_rotary_embedding && self.head_dim() % 2 != 0 {
            return Err(MlError::Config(format!(
                "rotary embedding needs an even head dim, got {}",
                self.head_dim()
            )));
        }
        if self.norm_eps.is_nan() || self.norm_eps <= 0.0 {
            return Err(MlError::Config("norm_eps must be positive".into()));
        }
        Ok(())
    }
}

/// Engine-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// STFT used for every chunk
    pub transform: TransformConfig,
    /// Architecture shared by both variants; the stem set comes from the tier
    pub model: ModelConfig,
    /// Chunk length in seconds
    pub chunk_seconds: f32,
    /// Crossfade length between chunks in seconds
    pub overlap_seconds: f32,
    /// Weight cache capacity
    pub cache_capacity: usize,
    /// Directory holding `<variant>-<version>.tflw` blobs
    pub weights_dir: PathBuf,
    pub weights_version: String,
    /// Fall back to placeholder weights when a blob is missing or corrupt
    pub allow_placeholder_weights: bool,
    /// Process chunks with rayon
    pub parallel: bool,
    /// Upper bound on chunks in flight at once. Each chunk holds several
    /// `[T, F, hidden]` activations, so this bounds peak memory.
    pub max_parallel_chunks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transform: TransformConfig::default(),
            model: ModelConfig::base(),
            chunk_seconds: 18.0,
            overlap_seconds: 1.75,
            cache_capacity: 3,
            weights_dir: PathBuf::from("weights"),
            weights_version: "v1".into(),
            allow_placeholder_weights: true,
            parallel: true,
            max_parallel_chunks: 2,
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; missing fields take defaults
    pub fn from_json(json: &str) -> MlResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> MlResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        Ok(config.with_env_overrides())
    }

    /// Apply `LOCOFORMER_WEIGHTS_DIR` if set
    pub fn with_env_overrides(self) -> Self {
        let dir = std::env::var_os(WEIGHTS_DIR_ENV).map(PathBuf::from);
        self.with_weights_dir_override(dir)
    }

    pub(crate) fn with_weights_dir_override(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir.filter(|d| !d.as_os_str().is_empty()) {
            log::info!("Weights directory overridden: {}", dir.display());
            self.weights_dir = dir;
        }
        self
    }

    /// Chunks processed per batch: 1 when sequential, otherwise
    /// `max_parallel_chunks` capped by the CPU count
    pub fn chunk_batch_size(&self) -> usize {
        if self.parallel {
            self.max_parallel_chunks.min(num_cpus::get()).max(1)
        } else {
            1
        }
    }

    /// Architecture for a tier
    pub fn model_config(&self, tier: Tier) -> ModelConfig {
        self.model.clone().with_stems(tier.stems())
    }

    pub fn validate(&self) -> MlResult<()> {
        self.transform.validate()?;
        self.model.validate()?;

        if self.model.num_freq_bins != self.transform.freq_bins() {
            return Err(MlError::Config(format!(
                "model expects {} frequency bins, transform yields {}",
                self.model.num_freq_bins,
                self.transform.freq_bins()
            )));
        }
        if self.chunk_seconds.is_nan() || self.chunk_seconds <= 0.0 {
            return Err(MlError::Config("chunk_seconds must be positive".into()));
        }
        if self.overlap_seconds.is_nan()
            || self.overlap_seconds < 0.0
            || 2.0 * self.overlap_seconds > self.chunk_seconds
        {
            return Err(MlError::Config(format!(
                "overlap {}s must be in 0..={}s",
                self.overlap_seconds,
                self.chunk_seconds / 2.0
            )));
        }
        if self.cache_capacity == 0 {
            return Err(MlError::Config("cache_capacity must be non-zero".into()));
        }
        if self.max_parallel_chunks == 0 {
            return Err(MlError::Config("max_parallel_chunks must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_config() {
        let config = ModelConfig::base();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_stems, 2);
        assert_eq!(config.stem_names, vec![StemKind::Vocals, StemKind::Instrumental]);
        assert_eq!(config.head_dim(), 32);
        assert_eq!(config.ffn_dim(), 512);
    }

    #[test]
    fn test_five_stem_differs_only_in_stems() {
        let base = ModelConfig::base();
        let five = ModelConfig::five_stem();
        assert!(five.validate().is_ok());
        assert_eq!(five.num_stems, 5);

        let normalized = five.with_stems(StemKind::two_stem());
        assert_eq!(normalized, base);
    }

    #[test]
    fn test_invalid_model_configs() {
        let bad_heads = ModelConfig {
            num_heads: 3,
            ..ModelConfig::base()
        };
        assert!(matches!(bad_heads.validate(), Err(MlError::Config(_))));

        let bad_groups = ModelConfig {
            norm_groups: 5,
            ..ModelConfig::base()
        };
        assert!(bad_groups.validate().is_err());

        let bad_stems = ModelConfig {
            num_stems: 3,
            ..ModelConfig::base()
        };
        assert!(bad_stems.validate().is_err());

        let odd_rotary = ModelConfig {
            hidden_dim: 12,
            num_heads: 4,
            norm_groups: 4,
            ..ModelConfig::base()
        };
        assert!(odd_rotary.validate().is_err());
    }

    #[test]
    fn test_stem_names_round_trip() {
        for stem in StemKind::five_stem().into_iter().chain(StemKind::two_stem()) {
            assert_eq!(stem.name().parse::<StemKind>().unwrap(), stem);
        }
        assert_eq!(" Vocals ".parse::<StemKind>().unwrap(), StemKind::Vocals);
        assert!("piano".parse::<StemKind>().is_err());
    }

    #[test]
    fn test_tier_mapping() {
        assert_eq!(Tier::Free.variant(), ModelVariant::TwoStem);
        assert_eq!(Tier::Pro.variant(), ModelVariant::FiveStem);
        assert_eq!(Tier::Free.stems().len(), 2);
        assert_eq!(Tier::Pro.stems().len(), 5);
        assert!(!Tier::Free.allows_gpu());
        assert!(Tier::Pro.allows_gpu());
    }

    #[test]
    fn test_engine_config_json() {
        let config = EngineConfig::from_json(
            r#"{ "chunk_seconds": 10.0, "overlap_seconds": 1.0, "weights_version": "v2" }"#,
        )
        .unwrap();
        assert_eq!(config.chunk_seconds, 10.0);
        assert_eq!(config.weights_version, "v2");
        assert_eq!(config.cache_capacity, 3);
        assert_eq!(config.model, ModelConfig::base());

        let overlap_too_long = EngineConfig::from_json(r#"{ "chunk_seconds": 2.0, "overlap_seconds": 1.5 }"#);
        assert!(overlap_too_long.is_err());
        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(MlError::Serialization(_))
        ));
    }

    #[test]
    fn test_chunk_batch_size_bounded() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel_chunks, 2);
        assert!(config.chunk_batch_size() <= 2);
        assert!(config.chunk_batch_size() >= 1);

        let wide = EngineConfig {
            max_parallel_chunks: 10_000,
            ..Default::default()
        };
        assert_eq!(wide.chunk_batch_size(), num_cpus::get());

        let sequential = EngineConfig {
            parallel: false,
            max_parallel_chunks: 8,
            ..Default::default()
        };
        assert_eq!(sequential.chunk_batch_size(), 1);

        let zero = EngineConfig::from_json(r#"{ "max_parallel_chunks": 0 }"#);
        assert!(matches!(zero, Err(MlError::Config(_))));
    }

    #[test]
    fn test_nan_durations_rejected() {
        let nan_eps = ModelConfig {
            norm_eps: f32::NAN,
            ..ModelConfig::base()
        };
        assert!(matches!(nan_eps.validate(), Err(MlError::Config(_))));

        for (chunk_seconds, overlap_seconds) in [(f32::NAN, 1.0), (18.0, f32::NAN), (0.0, 0.0), (18.0, -1.0)] {
            let config = EngineConfig {
                chunk_seconds,
                overlap_seconds,
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(MlError::Config(_))),
                "accepted chunk {chunk_seconds}s, overlap {overlap_seconds}s"
            );
        }
    }

    #[test]
    fn test_bins_must_match_transform() {
        let config = EngineConfig {
            transform: TransformConfig::new(1024, 256),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weights_dir_override() {
        let config = EngineConfig::default()
            .with_weights_dir_override(Some(PathBuf::from("/opt/weights")));
        assert_eq!(config.weights_dir, PathBuf::from("/opt/weights"));

        let untouched = EngineConfig::default().with_weights_dir_override(None);
        assert_eq!(untouched.weights_dir, PathBuf::from("weights"));
    }

    #[test]
    fn test_model_config_for_tier() {
        let config = EngineConfig::default();
        assert_eq!(config.model_config(Tier::Pro), ModelConfig::five_stem());
        assert_eq!(config.model_config(Tier::Free), ModelConfig::base());
    }
}
