//! Short-Time Fourier Transform
//!
//! Windowed forward/inverse FFT over a real signal:
//! - Reflect padding for centered frames
//! - One-sided output via real FFT, two-sided via complex FFT
//! - Conjugate-mirrored inverse with squared-window overlap-add normalization
//!
//! The same [`TransformConfig`] must be used for a forward call and its
//! matching inverse; the inverse rejects spectrograms whose bin count
//! disagrees with the config.

use std::sync::Arc;

use num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::error::{DspError, DspResult};
use crate::window::{WindowKind, create_window};
use crate::{OLA_EPSILON, sizes};

/// STFT parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// FFT size
    pub n_fft: usize,
    /// Samples between successive frames
    pub hop_length: usize,
    /// Window length (<= n_fft, zero-padded up to n_fft)
    pub win_length: usize,
    /// Window function
    pub window: WindowKind,
    /// Reflect-pad by n_fft/2 so frames are centered on their sample
    pub center: bool,
    /// Scale spectra by 1/sqrt(n_fft)
    pub normalized: bool,
    /// Keep only the non-negative frequency bins
    pub onesided: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            n_fft: sizes::N_FFT,
            hop_length: sizes::HOP_LENGTH,
            win_length: sizes::N_FFT,
            window: WindowKind::Hann,
            center: true,
            normalized: false,
            onesided: true,
        }
    }
}

impl TransformConfig {
    /// Config with `win_length == n_fft` and defaults elsewhere
    pub fn new(n_fft: usize, hop_length: usize) -> Self {
        Self {
            n_fft,
            hop_length,
            win_length: n_fft,
            ..Default::default()
        }
    }

    /// Number of frequency bins produced by `forward`
    pub fn freq_bins(&self) -> usize {
        if self.onesided {
            self.n_fft / 2 + 1
        } else {
            self.n_fft
        }
    }

    /// Number of frames `forward` yields for a signal of `len` samples
    pub fn num_frames(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let padded = if self.center { len + 2 * (self.n_fft / 2) } else { len };
        padded.saturating_sub(self.n_fft) / self.hop_length + 1
    }

    pub fn validate(&self) -> DspResult<()> {
        if self.n_fft == 0 {
            return Err(DspError::InvalidConfig("n_fft must be positive".into()));
        }
        if self.hop_length == 0 {
            return Err(DspError::InvalidConfig("hop_length must be positive".into()));
        }
        if self.win_length == 0 || self.win_length > self.n_fft {
            return Err(DspError::InvalidConfig(format!(
                "win_length {} must be in 1..={}",
                self.win_length, self.n_fft
            )));
        }
        Ok(())
    }
}

/// Complex spectrogram stored as split real/imag planes.
///
/// Element `(bin, frame)` lives at `bin * num_frames + frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexSpectrogram {
    real: Vec<f32>,
    imag: Vec<f32>,
    freq_bins: usize,
    num_frames: usize,
}

impl ComplexSpectrogram {
    /// All-zero spectrogram
    pub fn zeros(freq_bins: usize, num_frames: usize) -> Self {
        Self {
            real: vec![0.0; freq_bins * num_frames],
            imag: vec![0.0; freq_bins * num_frames],
            freq_bins,
            num_frames,
        }
    }

    /// Wrap existing planes, checking both match `freq_bins * num_frames`
    pub fn from_parts(
        real: Vec<f32>,
        imag: Vec<f32>,
        freq_bins: usize,
        num_frames: usize,
    ) -> DspResult<Self> {
        let expected = freq_bins * num_frames;
        if real.len() != expected || imag.len() != expected {
            return Err(DspError::ShapeMismatch {
                expected: format!("{expected} values ({freq_bins} bins x {num_frames} frames)"),
                got: format!("real {}, imag {}", real.len(), imag.len()),
            });
        }
        Ok(Self {
            real,
            imag,
            freq_bins,
            num_frames,
        })
    }

    pub fn freq_bins(&self) -> usize {
        self.freq_bins
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn real(&self) -> &[f32] {
        &self.real
    }

    pub fn imag(&self) -> &[f32] {
        &self.imag
    }

    /// Flat index of `(bin, frame)`
    #[inline]
    pub fn index(&self, bin: usize, frame: usize) -> usize {
        bin * self.num_frames + frame
    }

    #[inline]
    pub fn get(&self, bin: usize, frame: usize) -> Complex32 {
        let idx = self.index(bin, frame);
        Complex32::new(self.real[idx], self.imag[idx])
    }

    #[inline]
    pub fn set(&mut self, bin: usize, frame: usize, value: Complex32) {
        let idx = self.index(bin, frame);
        self.real[idx] = value.re;
        self.imag[idx] = value.im;
    }

    /// Per-element magnitude, same layout as the planes
    pub fn magnitude(&self) -> Vec<f32> {
        self.real
            .iter()
            .zip(&self.imag)
            .map(|(&re, &im)| (re * re + im * im).sqrt())
            .collect()
    }

    /// Per-element phase in radians
    pub fn phase(&self) -> Vec<f32> {
        self.real
            .iter()
            .zip(&self.imag)
            .map(|(&re, &im)| im.atan2(re))
            .collect()
    }

    /// Consume into `(real, imag)`
    pub fn into_parts(self) -> (Vec<f32>, Vec<f32>) {
        (self.real, self.imag)
    }
}

/// Planned STFT for a fixed [`TransformConfig`].
///
/// Planning is done once; `forward`/`inverse` only allocate frame buffers,
/// so a single `Stft` can be shared across threads.
pub struct Stft {
    config: TransformConfig,
    /// Window zero-padded to n_fft
    window: Vec<f32>,
    real_forward: Arc<dyn RealToComplex<f32>>,
    complex_forward: Arc<dyn Fft<f32>>,
    complex_inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(config: TransformConfig) -> DspResult<Self> {
        config.validate()?;

        let mut window = create_window(config.win_length, config.window);
        window.resize(config.n_fft, 0.0);

        let mut real_planner = RealFftPlanner::<f32>::new();
        let real_forward = real_planner.plan_fft_forward(config.n_fft);

        let mut planner = FftPlanner::<f32>::new();
        let complex_forward = planner.plan_fft_forward(config.n_fft);
        let complex_inverse = planner.plan_fft_inverse(config.n_fft);

        log::debug!(
            "Planned STFT: n_fft={}, hop={}, window={:?}",
            config.n_fft,
            config.hop_length,
            config.window
        );

        Ok(Self {
            config,
            window,
            real_forward,
            complex_forward,
            complex_inverse,
        })
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Analysis window, zero-padded to n_fft
    pub fn window(&self) -> &[f32] {
        &self.window
    }

    /// Forward STFT of a real signal
    pub fn forward(&self, signal: &[f32]) -> DspResult<ComplexSpectrogram> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let freq_bins = self.config.freq_bins();

        if signal.is_empty() {
            return Ok(ComplexSpectrogram::zeros(freq_bins, 0));
        }

        let mut padded = if self.config.center {
            reflect_pad(signal, n_fft / 2)
        } else {
            signal.to_vec()
        };
        if padded.len() < n_fft {
            padded.resize(n_fft, 0.0);
        }

        let num_frames = (padded.len() - n_fft) / hop + 1;
        let mut spec = ComplexSpectrogram::zeros(freq_bins, num_frames);
        let scale = if self.config.normalized {
            1.0 / (n_fft as f32).sqrt()
        } else {
            1.0
        };

        if self.config.onesided {
            let mut input = self.real_forward.make_input_vec();
            let mut output = self.real_forward.make_output_vec();
            let mut scratch = self.real_forward.make_scratch_vec();

            for frame in 0..num_frames {
                let start = frame * hop;
                for ((dst, &sample), &w) in input
                    .iter_mut()
                    .zip(&padded[start..start + n_fft])
                    .zip(&self.window)
                {
                    *dst = sample * w;
                }

                self.real_forward
                    .process_with_scratch(&mut input, &mut output, &mut scratch)
                    .map_err(|e| DspError::Fft(e.to_string()))?;

                for (bin, &value) in output.iter().enumerate() {
                    spec.set(bin, frame, value * scale);
                }
            }
        } else {
            let mut buffer = vec![Complex32::new(0.0, 0.0); n_fft];

            for frame in 0..num_frames {
                let start = frame * hop;
                for ((dst, &sample), &w) in buffer
                    .iter_mut()
                    .zip(&padded[start..start + n_fft])
                    .zip(&self.window)
                {
                    *dst = Complex32::new(sample * w, 0.0);
                }

                self.complex_forward.process(&mut buffer);

                for (bin, &value) in buffer.iter().enumerate() {
                    spec.set(bin, frame, value * scale);
                }
            }
        }

        Ok(spec)
    }

    /// Inverse STFT, returning exactly `target_len` samples
    pub fn inverse(&self, spec: &ComplexSpectrogram, target_len: usize) -> DspResult<Vec<f32>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;

        if spec.freq_bins() != self.config.freq_bins() {
            return Err(DspError::ShapeMismatch {
                expected: format!("{} frequency bins", self.config.freq_bins()),
                got: format!("{} frequency bins", spec.freq_bins()),
            });
        }

        let num_frames = spec.num_frames();
        if num_frames == 0 {
            return Ok(vec![0.0; target_len]);
        }

        let total_len = n_fft + hop * (num_frames - 1);
        let mut output = vec![0.0f32; total_len];
        let mut weight = vec![0.0f32; total_len];
        let mut buffer = vec![Complex32::new(0.0, 0.0); n_fft];

        let mut scale = 1.0 / n_fft as f32;
        if self.config.normalized {
            scale *= (n_fft as f32).sqrt();
        }

        for frame in 0..num_frames {
            self.fill_full_spectrum(spec, frame, &mut buffer);
            self.complex_inverse.process(&mut buffer);

            let start = frame * hop;
            for (i, (value, &w)) in buffer.iter().zip(&self.window).enumerate() {
                output[start + i] += value.re * scale * w;
                weight[start + i] += w * w;
            }
        }

        for (sample, &w) in output.iter_mut().zip(&weight) {
            if w > OLA_EPSILON {
                *sample /= w;
            }
        }

        let pad = if self.config.center { n_fft / 2 } else { 0 };
        let mut result: Vec<f32> = output.into_iter().skip(pad).take(target_len).collect();
        result.resize(target_len, 0.0);
        Ok(result)
    }

    /// Expand one frame to all n_fft bins (conjugate mirror when one-sided)
    fn fill_full_spectrum(&self, spec: &ComplexSpectrogram, frame: usize, buffer: &mut [Complex32]) {
        let n_fft = self.config.n_fft;
        let freq_bins = spec.freq_bins();

        buffer.fill(Complex32::new(0.0, 0.0));
        for (bin, slot) in buffer.iter_mut().enumerate().take(freq_bins) {
            *slot = spec.get(bin, frame);
        }

        if self.config.onesided {
            for bin in 1..freq_bins {
                let mirror = n_fft - bin;
                if mirror >= freq_bins {
                    buffer[mirror] = spec.get(bin, frame).conj();
                }
            }
        }
    }
}

/// Forward STFT with a one-off plan
pub fn forward(signal: &[f32], config: &TransformConfig) -> DspResult<ComplexSpectrogram> {
    Stft::new(config.clone())?.forward(signal)
}

/// Inverse STFT with a one-off plan
pub fn inverse(
    spec: &ComplexSpectrogram,
    target_len: usize,
    config: &TransformConfig,
) -> DspResult<Vec<f32>> {
    Stft::new(config.clone())?.inverse(spec, target_len)
}

/// Pad both ends by `pad` samples: left `signal[pad-1-i]`, right `signal[len-2-i]`.
/// Indices that leave the signal fold back symmetrically.
fn reflect_pad(signal: &[f32], pad: usize) -> Vec<f32> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(len + 2 * pad);

    padded.extend((0..pad).map(|i| signal[fold_index(pad as isize - 1 - i as isize, len)]));
    padded.extend_from_slice(signal);
    padded.extend((0..pad).map(|i| signal[fold_index(len as isize - 2 - i as isize, len)]));

    padded
}

#[inline]
fn fold_index(idx: isize, len: usize) -> usize {
    let len = len as isize;
    let period = 2 * len;
    let m = idx.rem_euclid(period);
    if m < len { m as usize } else { (period - 1 - m) as usize }
}
