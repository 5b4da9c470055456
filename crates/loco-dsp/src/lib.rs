//! # Locoformer DSP
//!
//! Signal-domain building blocks for the separation engine:
//! - Windowed STFT / iSTFT producing and consuming [`ComplexSpectrogram`]
//! - Analysis windows (Hann, Hamming, Blackman)
//! - Stem post-conditioning (rumble highpass, bass mono collapse)
//! - Peak limiting, soft limiting, downmix and PCM16 quantisation
//!
//! Everything here is pure computation with no I/O.

pub mod filters;
pub mod stft;
pub mod window;

mod error;

pub use error::{DspError, DspResult};
pub use stft::{ComplexSpectrogram, Stft, TransformConfig};
pub use window::{WindowKind, create_window};

/// Accumulated squared-window weight below which iSTFT leaves a sample untouched
pub const OLA_EPSILON: f32 = 1e-8;

/// Default STFT sizes for 44.1 kHz music
pub mod sizes {
    /// FFT size
    pub const N_FFT: usize = 2048;

    /// Hop between frames (75% overlap)
    pub const HOP_LENGTH: usize = 512;
}
