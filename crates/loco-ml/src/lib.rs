//! # Locoformer ML
//!
//! Inference-only music source separation with a dual-path
//! time-frequency transformer (TF-Locoformer):
//! - Free tier: 2 stems (vocals / instrumental), CPU only
//! - Pro tier: 5 stems (vocals / drums / bass / instruments / fx), GPU when available
//!
//! ## Architecture
//!
//! - `primitives`: linear/conv layers, RMS group norm, rotary embedding,
//!   multi-head attention, ConvSwiGLU
//! - `model`: the TF-Locoformer stack over complex spectrograms
//! - `weights`: `.tflw` blobs, bounded LRU cache, placeholder fallback
//! - `device`: GPU detection and tier-aware device selection
//! - `engine`: chunked STFT → model → iSTFT with crossfaded overlap-add
//!
//! ## Processing
//!
//! Offline only. Chunks of ~18 s are processed in parallel with rayon and
//! merged in order, so output is deterministic for a given input and weights.

pub mod config;
pub mod device;
pub mod engine;
pub mod model;
pub mod primitives;
pub mod weights;

mod error;

pub use config::{AttentionMode, EngineConfig, ModelConfig, ModelVariant, StemKind, Tier};
pub use device::{CpuOnlyProbe, Device, DeviceKind, DeviceProbe, GpuBackend, GpuCapability, SystemProbe};
pub use engine::{
    CancelToken, ChunkProgress, EngineMetadata, EngineStatus, OutputFormat, SeparationEngine, SeparationOptions,
    SeparationResult, StereoMode,
};
pub use error::{MlError, MlResult};
pub use model::TfLocoformer;
pub use weights::{DegradedReason, WeightKey, WeightQuality, WeightStore};
