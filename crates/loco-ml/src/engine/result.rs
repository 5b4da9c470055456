//! Separation options and result structures

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ModelVariant, StemKind, Tier};
use crate::weights::WeightQuality;

/// Sample format of returned stems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Raw model output
    #[default]
    Float32,
    /// Clamped and rounded to the 16-bit grid (still stored as f32)
    Pcm16,
}

/// How stereo input is fed to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StereoMode {
    /// Average both channels, separate once
    #[default]
    Downmix,
    /// Separate each channel independently
    PerChannel,
}

/// Per-call settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationOptions {
    pub tier: Tier,
    pub sample_rate: u32,
    /// 1 (mono) or 2 (interleaved stereo)
    pub channels: usize,
    /// Scale stems whose peak exceeds 0.95 down to 0.95
    pub normalize: bool,
    pub output_format: OutputFormat,
    /// Attach [`EngineMetadata`] to the result
    pub debug: bool,
    pub stereo_mode: StereoMode,
}

impl Default for SeparationOptions {
    fn default() -> Self {
        Self {
            tier: Tier::Free,
            sample_rate: 44100,
            channels: 2,
            normalize: false,
            output_format: OutputFormat::Float32,
            debug: false,
            stereo_mode: StereoMode::Downmix,
        }
    }
}

impl SeparationOptions {
    pub fn new(tier: Tier, sample_rate: u32, channels: usize) -> Self {
        Self {
            tier,
            sample_rate,
            channels,
            ..Default::default()
        }
    }
}

/// Single separated stem
#[derive(Debug, Clone, PartialEq)]
pub struct StemOutput {
    pub kind: StemKind,
    /// Interleaved when `channels == 2`
    pub audio: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl StemOutput {
    pub fn new(kind: StemKind, audio: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        Self {
            kind,
            audio,
            channels,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.audio.len() as f64 / (self.channels as f64 * self.sample_rate as f64)
    }

    pub fn peak(&self) -> f32 {
        loco_dsp::filters::peak(&self.audio)
    }

    pub fn rms(&self) -> f32 {
        if self.audio.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = self.audio.iter().map(|&s| s * s).sum();
        (sum_sq / self.audio.len() as f32).sqrt()
    }
}

/// Stems in model order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StemCollection {
    stems: Vec<StemOutput>,
}

impl StemCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stem, replacing any previous stem of the same kind
    pub fn add(&mut self, stem: StemOutput) {
        if let Some(existing) = self.stems.iter_mut().find(|s| s.kind == stem.kind) {
            *existing = stem;
        } else {
            self.stems.push(stem);
        }
    }

    pub fn get(&self, kind: StemKind) -> Option<&StemOutput> {
        self.stems.iter().find(|s| s.kind == kind)
    }

    pub fn take(&mut self, kind: StemKind) -> Option<StemOutput> {
        let pos = self.stems.iter().position(|s| s.kind == kind)?;
        Some(self.stems.remove(pos))
    }

    pub fn kinds(&self) -> Vec<StemKind> {
        self.stems.iter().map(|s| s.kind).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StemOutput> {
        self.stems.iter()
    }

    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    /// Weighted sum of the stems; kinds missing from `gains` are left out
    pub fn remix(&self, gains: &BTreeMap<StemKind, f32>) -> Option<Vec<f32>> {
        let len = self.stems.first()?.audio.len();
        let mut mix = vec![0.0f32; len];
        for stem in &self.stems {
            let Some(&gain) = gains.get(&stem.kind) else {
                continue;
            };
            for (m, &s) in mix.iter_mut().zip(&stem.audio) {
                *m += s * gain;
            }
        }
        Some(mix)
    }
}

impl<'a> IntoIterator for &'a StemCollection {
    type Item = &'a StemOutput;
    type IntoIter = std::slice::Iter<'a, StemOutput>;

    fn into_iter(self) -> Self::IntoIter {
        self.stems.iter()
    }
}

/// How chunks were scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Internals attached when [`SeparationOptions::debug`] is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetadata {
    pub variant: ModelVariant,
    pub version: String,
    /// SHA-256 hex of the weights
    pub weight_hash: String,
    /// Samples per chunk
    pub chunk_size: usize,
    pub overlap_size: usize,
    pub hop_size: usize,
    pub chunk_count: usize,
    pub execution_mode: ExecutionMode,
    pub stems: Vec<StemKind>,
}

#[derive(Debug, Clone)]
pub struct SeparationResult {
    /// One buffer per stem, each as long as the input buffer
    pub stems: StemCollection,
    pub sample_rate: u32,
    pub channels: usize,
    pub duration_secs: f64,
    pub processing_time_ms: u64,
    /// Name of the device the engine was initialized on
    pub device: String,
    pub weight_quality: WeightQuality,
    pub metadata: Option<EngineMetadata>,
}

impl SeparationResult {
    pub fn stem(&self, kind: StemKind) -> Option<&[f32]> {
        self.stems.get(kind).map(|s| s.audio.as_slice())
    }

    /// Realtime factor (audio duration / processing time)
    pub fn realtime_factor(&self) -> f64 {
        if self.processing_time_ms == 0 {
            return f64::INFINITY;
        }
        self.duration_secs * 1000.0 / self.processing_time_ms as f64
    }
}
