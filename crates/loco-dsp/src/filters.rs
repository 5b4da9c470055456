//! Stem post-conditioning and level utilities
//!
//! Offline, whole-buffer processors applied once per stem after separation:
//! - One-pole highpass (vocal rumble removal)
//! - Biquad TDF-II sections cascaded into Linkwitz-Riley filters
//! - Low-frequency mono collapse for stereo bass (mid/side)
//! - Peak ceiling, tanh soft limiter, downmix, PCM16 quantisation

use std::f64::consts::PI;

use crate::error::{DspError, DspResult};

/// Butterworth Q for a 2nd-order section
const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Single-pole RC highpass.
///
/// `y[n] = a * (y[n-1] + x[n] - x[n-1])`, `a = RC / (RC + dt)`.
#[derive(Debug, Clone, Copy)]
pub struct OnePoleHighpass {
    alpha: f64,
    prev_input: f64,
    prev_output: f64,
}

impl OnePoleHighpass {
    pub fn new(cutoff_hz: f64, sample_rate: f64) -> Self {
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        let dt = 1.0 / sample_rate;
        Self {
            alpha: rc / (rc + dt),
            prev_input: 0.0,
            prev_output: 0.0,
        }
    }

    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        let x = input as f64;
        let y = self.alpha * (self.prev_output + x - self.prev_input);
        self.prev_input = x;
        self.prev_output = y;
        y as f32
    }

    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer {
            *sample = self.process_sample(*sample);
        }
    }

    pub fn reset(&mut self) {
        self.prev_input = 0.0;
        self.prev_output = 0.0;
    }
}

/// Normalized biquad coefficients (a0 == 1)
#[derive(Debug, Clone, Copy, Default)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// RBJ lowpass
    pub fn lowpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = (1.0 - cos_omega) / 2.0;
        let b1 = 1.0 - cos_omega;
        let b2 = (1.0 - cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// RBJ highpass
    pub fn highpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = (1.0 + cos_omega) / 2.0;
        let b1 = -(1.0 + cos_omega);
        let b2 = (1.0 + cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Transposed Direct Form II biquad
#[derive(Debug, Clone, Copy, Default)]
pub struct BiquadTDF2 {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl BiquadTDF2 {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    pub fn process_sample(&mut self, input: f64) -> f64 {
        let c = &self.coeffs;
        let output = c.b0 * input + self.z1;
        self.z1 = c.b1 * input - c.a1 * output + self.z2;
        self.z2 = c.b2 * input - c.a2 * output;
        output
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// 4th-order Linkwitz-Riley lowpass (two cascaded Butterworth sections)
pub fn linkwitz_riley_lowpass(input: &[f32], cutoff_hz: f64, sample_rate: f64) -> Vec<f32> {
    cascade(input, BiquadCoeffs::lowpass(cutoff_hz, BUTTERWORTH_Q, sample_rate))
}

/// 4th-order Linkwitz-Riley highpass
pub fn linkwitz_riley_highpass(input: &[f32], cutoff_hz: f64, sample_rate: f64) -> Vec<f32> {
    cascade(input, BiquadCoeffs::highpass(cutoff_hz, BUTTERWORTH_Q, sample_rate))
}

fn cascade(input: &[f32], coeffs: BiquadCoeffs) -> Vec<f32> {
    let mut first = BiquadTDF2::new(coeffs);
    let mut second = BiquadTDF2::new(coeffs);

    input
        .iter()
        .map(|&x| second.process_sample(first.process_sample(x as f64)) as f32)
        .collect()
}

/// Make everything below `cutoff_hz` mono while keeping the stereo highs.
///
/// Works in mid/side: the side channel is highpassed and recombined with
/// the untouched mid, so an input that is already mono passes through
/// bit-exact.
pub fn collapse_low_end(left: &mut [f32], right: &mut [f32], cutoff_hz: f64, sample_rate: f64) {
    let len = left.len().min(right.len());
    let side: Vec<f32> = (0..len).map(|i| 0.5 * (left[i] - right[i])).collect();
    let side_high = linkwitz_riley_highpass(&side, cutoff_hz, sample_rate);

    for i in 0..len {
        let mid = 0.5 * (left[i] + right[i]);
        left[i] = mid + side_high[i];
        right[i] = mid - side_high[i];
    }
}

/// Highest absolute sample value
pub fn peak(buffer: &[f32]) -> f32 {
    buffer.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

/// Scale the whole buffer down so its peak equals `ceiling`; quieter
/// buffers are left untouched. Returns the gain applied.
pub fn limit_peak(buffer: &mut [f32], ceiling: f32) -> f32 {
    let current = peak(buffer);
    if current <= ceiling || current <= 0.0 {
        return 1.0;
    }
    let gain = ceiling / current;
    for sample in buffer.iter_mut() {
        *sample *= gain;
    }
    gain
}

/// `threshold * tanh(x / threshold)` above the threshold, identity below
#[inline]
pub fn soft_limit_sample(x: f32, threshold: f32) -> f32 {
    if x.abs() > threshold {
        threshold * (x / threshold).tanh()
    } else {
        x
    }
}

pub fn soft_limit(buffer: &mut [f32], threshold: f32) {
    for sample in buffer {
        *sample = soft_limit_sample(*sample, threshold);
    }
}

/// Average interleaved channels to mono
pub fn downmix(interleaved: &[f32], channels: usize) -> DspResult<Vec<f32>> {
    if channels == 0 || interleaved.len() % channels != 0 {
        return Err(DspError::ShapeMismatch {
            expected: format!("multiple of {channels} channels"),
            got: format!("{} samples", interleaved.len()),
        });
    }
    if channels == 1 {
        return Ok(interleaved.to_vec());
    }

    let scale = 1.0 / channels as f32;
    Ok(interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect())
}

/// Split interleaved audio into per-channel buffers
pub fn deinterleave(interleaved: &[f32], channels: usize) -> DspResult<Vec<Vec<f32>>> {
    if channels == 0 || interleaved.len() % channels != 0 {
        return Err(DspError::ShapeMismatch {
            expected: format!("multiple of {channels} channels"),
            got: format!("{} samples", interleaved.len()),
        });
    }

    let frames = interleaved.len() / channels;
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (plane, &sample) in planes.iter_mut().zip(frame) {
            plane.push(sample);
        }
    }
    Ok(planes)
}

/// Interleave equal-length channel buffers
pub fn interleave(planes: &[Vec<f32>]) -> Vec<f32> {
    let frames = planes.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * planes.len());
    for i in 0..frames {
        for plane in planes {
            out.push(plane[i]);
        }
    }
    out
}

/// Clamp to [-1, 1] and snap to the signed 16-bit grid
pub fn quantize_pcm16(buffer: &mut [f32]) {
    const SCALE: f32 = i16::MAX as f32;
    for sample in buffer {
        *sample = (sample.clamp(-1.0, 1.0) * SCALE).round() / SCALE;
    }
}
