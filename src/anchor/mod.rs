//! Degraded "anchor" stimuli that calibrate the low end of a rating scale.
//!
//! The synthesizer producing the variants is pluggable; the pipeline only
//! relies on the named fields of [`AnchorSet`] and on [`combine_anchors`].

pub mod synth;

use crate::audio::{AudioError, AudioSignal, db_to_amp};

pub use synth::ClipGateSynthesizer;

/// Extra parameters of the remix form, where anchors are built for a mixture
/// rather than for an isolated target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemixParams {
    /// Level of the target relative to the interferers in the level anchor (dB).
    pub target_level_offset: f64,
    /// dB trims applied to the Distortion and Artefacts parts of the quality anchor.
    pub balance: [f64; 2],
}

/// Input to an [`AnchorSynthesizer`].
#[derive(Debug, Clone)]
pub struct AnchorRequest<'a> {
    pub target: &'a AudioSignal,
    pub interferers: &'a [AudioSignal],
    /// In [0, 1].
    pub trim_factor_distorted: f64,
    /// In [0, 1].
    pub trim_factor_artefacts: f64,
    pub remix: Option<RemixParams>,
}

/// Fixed set of anchor variants for one target.
#[derive(Debug, Clone)]
pub struct AnchorSet {
    pub distortion: AudioSignal,
    pub artefacts: AudioSignal,
    pub interferer: AudioSignal,
    pub quality: Option<AudioSignal>,
}

impl AnchorSet {
    /// Variants with their canonical names, in declaration order.
    pub fn named(&self) -> Vec<(&'static str, &AudioSignal)> {
        let mut out = vec![
            ("Distortion", &self.distortion),
            ("Artefacts", &self.artefacts),
            ("Interferer", &self.interferer),
        ];
        if let Some(q) = &self.quality {
            out.push(("Quality", q));
        }
        out
    }
}

/// Produces anchor variants from a target and its interferers.
pub trait AnchorSynthesizer: Send + Sync {
    fn create(&self, request: &AnchorRequest<'_>) -> Result<AnchorSet, AudioError>;
}

const DISTORTION_WEIGHT: f64 = 0.7;
const ARTEFACTS_WEIGHT: f64 = 0.3;

/// Blend Distortion and Artefacts into one quality anchor:
/// `0.7·D + 0.3·g·A` with `g` matching the artefacts' loudness to the distortion's.
pub fn combine_anchors(
    distortion: &AudioSignal,
    artefacts: &AudioSignal,
) -> Result<AudioSignal, AudioError> {
    let gain = loudness_match_gain(distortion, artefacts);
    let mut out = distortion.scaled(DISTORTION_WEIGHT);
    out.add_scaled(artefacts, ARTEFACTS_WEIGHT * gain)?;
    Ok(out)
}

/// Linear gain bringing `from` to the loudness of `to`; unity when either
/// side is silent.
pub(crate) fn loudness_match_gain(to: &AudioSignal, from: &AudioSignal) -> f64 {
    let delta = to.loudness() - from.loudness();
    if delta.is_finite() { db_to_amp(delta) } else { 1.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, amp: f64) -> AudioSignal {
        let sr = 16000;
        AudioSignal::mono(
            (0..sr)
                .map(|i| {
                    (amp * (2.0 * std::f64::consts::PI * freq * i as f64 / sr as f64).sin()) as f32
                })
                .collect(),
            sr as u32,
        )
    }

    #[test]
    fn test_combine_weights_and_loudness_gain() {
        let d = tone(500.0, 0.4);
        let a = tone(500.0, 0.1);
        let mixed = combine_anchors(&d, &a).unwrap();
        // Same waveform shape: g·A == D, so the blend equals D.
        for (m, x) in mixed.samples().iter().zip(d.samples()) {
            assert!((m - x).abs() < 1e-4, "{m} vs {x}");
        }
    }

    #[test]
    fn test_combine_with_silent_artefacts() {
        let d = tone(500.0, 0.4);
        let a = AudioSignal::silence(d.frames(), 1, d.sample_rate());
        let mixed = combine_anchors(&d, &a).unwrap();
        assert!((mixed.peak() - 0.7 * d.peak()).abs() < 1e-6);
    }

    #[test]
    fn test_named_fields() {
        let s = tone(100.0, 0.1);
        let set = AnchorSet {
            distortion: s.clone(),
            artefacts: s.clone(),
            interferer: s.clone(),
            quality: None,
        };
        let names: Vec<&str> = set.named().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["Distortion", "Artefacts", "Interferer"]);

        let with_quality = AnchorSet {
            quality: Some(s),
            ..set
        };
        assert_eq!(with_quality.named().len(), 4);
    }
}
