//! Analysis/synthesis windows

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Window function family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    /// Window value at `i` for a symmetric window of length `len`
    #[inline]
    fn value(self, i: usize, len: usize) -> f32 {
        let denom = (len - 1) as f32;
        let phase = 2.0 * PI * i as f32 / denom;
        match self {
            WindowKind::Hann => 0.5 * (1.0 - phase.cos()),
            WindowKind::Hamming => 0.54 - 0.46 * phase.cos(),
            WindowKind::Blackman => 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos(),
        }
    }
}

/// Create a symmetric window of `len` samples.
///
/// A single-sample window is `[1.0]`; an empty window is empty.
pub fn create_window(len: usize, kind: WindowKind) -> Vec<f32> {
    match len {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => (0..len).map(|i| kind.value(i, len)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_endpoints_and_peak() {
        let w = create_window(512, WindowKind::Hann);
        assert_eq!(w.len(), 512);
        assert!(w[0].abs() < 1e-5);
        assert!((w[255] - 1.0).abs() < 1e-5);
        assert!(w[511].abs() < 1e-5);
    }

    #[test]
    fn test_hamming_floor() {
        let w = create_window(64, WindowKind::Hamming);
        assert!((w[0] - 0.08).abs() < 1e-5);
        assert!((w[63] - 0.08).abs() < 1e-5);
    }

    #[test]
    fn test_blackman_symmetric() {
        let w = create_window(101, WindowKind::Blackman);
        for i in 0..50 {
            assert!((w[i] - w[100 - i]).abs() < 1e-5);
        }
        assert!((w[50] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_degenerate_lengths() {
        assert!(create_window(0, WindowKind::Hann).is_empty());
        assert_eq!(create_window(1, WindowKind::Blackman), vec![1.0]);
    }
}
