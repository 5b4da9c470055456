//! Chunk layout and crossfade windows for long recordings

use std::f32::consts::FRAC_PI_2;

use crate::error::{MlError, MlResult};

/// Chunk positions over a signal of `total_len` samples.
///
/// Chunks are `chunk` samples long and start every `hop = chunk - overlap`
/// samples; the last chunk is the first one reaching the end of the signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk: usize,
    pub overlap: usize,
    pub hop: usize,
    pub total_len: usize,
    starts: Vec<usize>,
}

impl ChunkPlan {
    pub fn new(total_len: usize, sample_rate: u32, chunk_secs: f32, overlap_secs: f32) -> MlResult<Self> {
        let chunk = ((chunk_secs * sample_rate as f32).round() as usize).max(1);
        let overlap = (overlap_secs * sample_rate as f32).round() as usize;
        Self::from_samples(total_len, chunk, overlap)
    }

    pub fn from_samples(total_len: usize, chunk: usize, overlap: usize) -> MlResult<Self> {
        if chunk == 0 || 2 * overlap > chunk {
            return Err(MlError::Config(format!(
                "overlap of {overlap} samples does not fit twice in a {chunk}-sample chunk"
            )));
        }
        let hop = chunk - overlap;

        let mut starts = Vec::new();
        if total_len > 0 {
            let mut start = 0;
            loop {
                starts.push(start);
                if start + chunk >= total_len {
                    break;
                }
                start += hop;
            }
        }

        Ok(Self {
            chunk,
            overlap,
            hop,
            total_len,
            starts,
        })
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    /// Samples of chunk `index` that fall inside the signal
    pub fn valid_len(&self, index: usize) -> usize {
        self.starts
            .get(index)
            .map_or(0, |&start| self.chunk.min(self.total_len - start))
    }

    /// Copy chunk `index` out of `signal`, zero-padded to `chunk` samples
    pub fn extract(&self, signal: &[f32], index: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.chunk];
        if let Some(&start) = self.starts.get(index) {
            let end = (start + self.chunk).min(signal.len());
            out[..end - start].copy_from_slice(&signal[start..end]);
        }
        out
    }

    /// Crossfade window for chunk `index`.
    ///
    /// Raised-cosine fade-in over the first `overlap` samples, unity middle,
    /// complementary fade-out over the last `overlap` samples. Adjacent fades
    /// sum to 1. The first chunk has no fade-in and the last no fade-out, so
    /// the start and end of the recording keep unity gain instead of being
    /// ramped from silence.
    pub fn window(&self, index: usize) -> Vec<f32> {
        let mut window = vec![1.0f32; self.chunk];
        if self.overlap == 0 {
            return window;
        }

        let ramp = |j: usize| {
            let phase = FRAC_PI_2 * (j as f32 + 0.5) / self.overlap as f32;
            phase.sin().powi(2)
        };

        if index > 0 {
            for (j, w) in window.iter_mut().take(self.overlap).enumerate() {
                *w = ramp(j);
            }
        }
        if index + 1 < self.starts.len() {
            let tail = self.chunk - self.overlap;
            for (j, w) in window[tail..].iter_mut().enumerate() {
                *w = 1.0 - ramp(j);
            }
        }
        window
    }
}
