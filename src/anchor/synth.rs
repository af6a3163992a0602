//! Built-in deterministic anchor synthesizer.
//!
//! - Distortion: hard clip below the peak, then a 3.5 kHz low-pass
//! - Artefacts: 10 ms frames gated out on a low-discrepancy sequence
//! - Interferer: target with the interferers mixed in at matched loudness
//!
//! No randomness is involved, so identical inputs always produce identical
//! stimuli.

use super::{
    AnchorRequest, AnchorSet, AnchorSynthesizer, combine_anchors, loudness_match_gain,
};
use crate::audio::filter::Biquad;
use crate::audio::{AudioError, AudioSignal, db_to_amp};

const LOW_PASS_HZ: f64 = 3500.0;
const GATE_FRAME_SECS: f64 = 0.01;
/// Fractional part of the golden ratio.
const GOLDEN_FRACTION: f64 = 0.618_033_988_749_894_8;

#[derive(Debug, Clone)]
pub struct ClipGateSynthesizer {
    pub low_pass_hz: f64,
    pub gate_frame_secs: f64,
}

impl Default for ClipGateSynthesizer {
    fn default() -> Self {
        Self {
            low_pass_hz: LOW_PASS_HZ,
            gate_frame_secs: GATE_FRAME_SECS,
        }
    }
}

impl ClipGateSynthesizer {
    /// Clip at `(1 - trim)` of the peak and band-limit.
    fn distort(&self, base: &AudioSignal, trim: f64) -> AudioSignal {
        let threshold = ((1.0 - trim.clamp(0.0, 1.0)) * base.peak() as f64) as f32;
        let mut out = base.clone();
        for s in out.samples_mut() {
            *s = s.clamp(-threshold, threshold);
        }
        if self.low_pass_hz < base.sample_rate() as f64 / 2.0 {
            low_pass(&mut out, self.low_pass_hz);
        }
        out
    }

    /// Zero out roughly `trim` of all short frames.
    fn gate(&self, base: &AudioSignal, trim: f64) -> AudioSignal {
        let frame_len =
            ((self.gate_frame_secs * base.sample_rate() as f64).round() as usize).max(1);
        let mut out = base.clone();
        for (i, frame) in out.frame_iter_mut().enumerate() {
            let k = (i / frame_len + 1) as f64;
            if (k * GOLDEN_FRACTION).fract() < trim {
                frame.fill(0.0);
            }
        }
        out
    }
}

/// Filter each channel independently, in place.
fn low_pass(signal: &mut AudioSignal, cutoff: f64) {
    let proto = Biquad::low_pass(cutoff, signal.sample_rate() as f64);
    let mut filters = vec![proto; signal.channels() as usize];
    for frame in signal.frame_iter_mut() {
        for (s, f) in frame.iter_mut().zip(filters.iter_mut()) {
            *s = f.process(*s as f64) as f32;
        }
    }
}

/// Sum of the interferers, or silence shaped like `like` when there are none.
fn interferer_sum(
    interferers: &[AudioSignal],
    like: &AudioSignal,
) -> Result<AudioSignal, AudioError> {
    if interferers.is_empty() {
        return Ok(AudioSignal::silence(like.frames(), like.channels(), like.sample_rate()));
    }
    AudioSignal::sum(interferers)
}

impl AnchorSynthesizer for ClipGateSynthesizer {
    fn create(&self, request: &AnchorRequest<'_>) -> Result<AnchorSet, AudioError> {
        let target = request.target;
        let others = interferer_sum(request.interferers, target)?;

        let base = match request.remix {
            Some(_) => target.mix(1.0, &others)?,
            None => target.clone(),
        };

        let distortion = self.distort(&base, request.trim_factor_distorted);
        let artefacts = self.gate(&base, request.trim_factor_artefacts);

        let (interferer, quality) = match request.remix {
            Some(remix) => {
                let interferer = target.mix(db_to_amp(remix.target_level_offset), &others)?;
                let mut quality = distortion.scaled(0.7 * db_to_amp(remix.balance[0]));
                let g = loudness_match_gain(&distortion, &artefacts);
                quality.add_scaled(&artefacts, 0.3 * g * db_to_amp(remix.balance[1]))?;
                (interferer, Some(quality))
            }
            None => {
                let g = loudness_match_gain(target, &others);
                let interferer = target.mix(1.0, &others.scaled(g))?;
                (interferer, Some(combine_anchors(&distortion, &artefacts)?))
            }
        };

        log::trace!(
            "Anchors built: {} frames, {} interferer(s), remix={}",
            target.frames(),
            request.interferers.len(),
            request.remix.is_some()
        );
        Ok(AnchorSet {
            distortion,
            artefacts,
            interferer,
            quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::RemixParams;
    use std::f64::consts::PI;

    fn tone(freq: f64, amp: f64, sr: u32, secs: f64) -> AudioSignal {
        let n = (secs * sr as f64) as usize;
        AudioSignal::mono(
            (0..n)
                .map(|i| (amp * (2.0 * PI * freq * i as f64 / sr as f64).sin()) as f32)
                .collect(),
            sr,
        )
    }

    fn request<'a>(
        target: &'a AudioSignal,
        interferers: &'a [AudioSignal],
        remix: Option<RemixParams>,
    ) -> AnchorRequest<'a> {
        AnchorRequest {
            target,
            interferers,
            trim_factor_distorted: 0.2,
            trim_factor_artefacts: 0.99,
            remix,
        }
    }

    #[test]
    fn test_shapes_match_target() {
        let t = tone(220.0, 0.5, 16000, 1.0);
        let i = vec![tone(330.0, 0.2, 16000, 1.0), tone(80.0, 0.3, 16000, 1.0)];
        let set = ClipGateSynthesizer::default().create(&request(&t, &i, None)).unwrap();
        for (name, s) in set.named() {
            assert_eq!(s.frames(), t.frames(), "{name}");
            assert_eq!(s.channels(), 1, "{name}");
        }
        assert!(set.quality.is_some());
    }

    #[test]
    fn test_distortion_clips_below_peak() {
        let t = tone(100.0, 1.0, 16000, 1.0);
        let set = ClipGateSynthesizer::default().create(&request(&t, &[], None)).unwrap();
        // 100 Hz passes the low-pass nearly untouched; clipping at 0.8 dominates
        assert!(set.distortion.peak() < 0.9);
        assert!(set.distortion.peak() > 0.7);
    }

    #[test]
    fn test_artefacts_gate_most_frames() {
        let t = AudioSignal::mono(vec![0.5; 16000], 16000);
        let set = ClipGateSynthesizer::default().create(&request(&t, &[], None)).unwrap();
        let zeros = set.artefacts.samples().iter().filter(|&&s| s == 0.0).count();
        // trim 0.99: roughly 99% silenced
        assert!(zeros as f64 / t.frames() as f64 > 0.95);
        assert!(zeros < t.frames());
    }

    #[test]
    fn test_deterministic() {
        let t = tone(440.0, 0.5, 8000, 0.5);
        let i = vec![tone(60.0, 0.5, 8000, 0.5)];
        let synth = ClipGateSynthesizer::default();
        let a = synth.create(&request(&t, &i, None)).unwrap();
        let b = synth.create(&request(&t, &i, None)).unwrap();
        assert_eq!(a.artefacts, b.artefacts);
        assert_eq!(a.distortion, b.distortion);
        assert_eq!(a.interferer, b.interferer);
    }

    #[test]
    fn test_remix_interferer_uses_level_offset() {
        let t = tone(440.0, 0.5, 8000, 0.5);
        let i = vec![AudioSignal::silence(t.frames(), 1, 8000)];
        let remix = RemixParams {
            target_level_offset: -14.0,
            balance: [0.0, 0.0],
        };
        let set = ClipGateSynthesizer::default()
            .create(&request(&t, &i, Some(remix)))
            .unwrap();
        let expected = t.scaled(db_to_amp(-14.0));
        for (a, b) in set.interferer.samples().iter().zip(expected.samples()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mismatched_interferer_is_rejected() {
        let t = tone(440.0, 0.5, 8000, 0.5);
        let i = vec![tone(440.0, 0.5, 8000, 0.25)];
        assert!(ClipGateSynthesizer::default().create(&request(&t, &i, None)).is_err());
    }
}
