//! Stem-specific conditioning applied after overlap-add

use loco_dsp::filters::{OnePoleHighpass, collapse_low_end, deinterleave, interleave};

use crate::config::StemKind;
use crate::error::MlResult;

/// Vocal rumble cutoff
pub const VOCAL_HIGHPASS_HZ: f64 = 30.0;

/// Bass content below this is folded to mono
pub const BASS_MONO_HZ: f64 = 120.0;

/// Condition one stem in place. `audio` is interleaved when `channels == 2`.
pub fn condition(kind: StemKind, audio: &mut Vec<f32>, channels: usize, sample_rate: u32) -> MlResult<()> {
    let sr = sample_rate as f64;
    match kind {
        StemKind::Vocals => {
            let mut planes = deinterleave(audio, channels)?;
            for plane in &mut planes {
                OnePoleHighpass::new(VOCAL_HIGHPASS_HZ, sr).process_block(plane);
            }
            *audio = interleave(&planes);
        }
        StemKind::Bass => {
            if channels == 2 {
                let mut planes = deinterleave(audio, channels)?;
                let (left, right) = planes.split_at_mut(1);
                collapse_low_end(&mut left[0], &mut right[0], BASS_MONO_HZ, sr);
                *audio = interleave(&planes);
            }
        }
        StemKind::Instrumental | StemKind::Drums | StemKind::Instruments | StemKind::Fx => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const SR: u32 = 8000;

    #[test]
    fn test_vocals_lose_dc() {
        let mut audio = vec![0.5f32; 4000];
        condition(StemKind::Vocals, &mut audio, 1, SR).unwrap();
        assert!(audio[3999].abs() < 0.01);
    }

    #[test]
    fn test_bass_mono_untouched() {
        let original: Vec<f32> = (0..512).map(|i| (i as f32 * 0.05).sin()).collect();
        let mut audio = original.clone();
        condition(StemKind::Bass, &mut audio, 1, SR).unwrap();
        assert_eq!(audio, original);
    }

    #[test]
    fn test_bass_low_end_collapsed() {
        // 40 Hz in opposite polarity is pure side content below the crossover
        let frames = 8000;
        let mut audio = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let s = (2.0 * PI * 40.0 * i as f32 / SR as f32).sin() * 0.5;
            audio.push(s);
            audio.push(-s);
        }
        condition(StemKind::Bass, &mut audio, 2, SR).unwrap();

        let tail = &audio[frames..];
        let side: f32 = tail.chunks(2).map(|p| ((p[0] - p[1]) * 0.5).abs()).sum::<f32>() / (tail.len() / 2) as f32;
        assert!(side < 0.05, "side energy left: {side}");
    }

    #[test]
    fn test_other_stems_untouched() {
        let original: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
        for kind in [StemKind::Drums, StemKind::Instruments, StemKind::Fx, StemKind::Instrumental] {
            let mut audio = original.clone();
            condition(kind, &mut audio, 2, SR).unwrap();
            assert_eq!(audio, original);
        }
    }
}
