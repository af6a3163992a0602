//! Active segment location and click-free cropping.
//!
//! A track is represented in every stimulus by one fixed-length window. The
//! window is chosen on the reference target stem: frame energies are computed
//! over overlapping windows of the requested length (hop = length / 4), and
//! the frame whose energy is closest to a given percentile of all frame
//! energies wins. A high-but-not-maximal percentile avoids both silent
//! passages and isolated transients.

use thiserror::Error;

use super::{AudioError, AudioSignal};
use crate::stats;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Segment duration must be positive, got {0} s")]
    InvalidDuration(f64),
    #[error("Percentile must lie in [0, 100], got {0}")]
    InvalidPercentile(f64),
    #[error("Signal of {frames} frames is shorter than the {window}-frame window")]
    TooShort { frames: usize, window: usize },
    #[error(transparent)]
    Audio(#[from] AudioError),
}

/// Frame range `[start, end)` shared by every stem and method of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ActiveWindow {
    pub start: usize,
    pub end: usize,
}

impl ActiveWindow {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn start_secs(&self, sample_rate: u32) -> f64 {
        self.start as f64 / sample_rate as f64
    }
}

/// Window length in frames for `duration` seconds.
pub fn window_frames(duration: f64, sample_rate: u32) -> usize {
    (duration * sample_rate as f64).round() as usize
}

/// Mean squared amplitude of each full frame of the mono signal.
/// Trailing samples that do not fill a frame are not analysed.
pub fn frame_energies(mono: &[f32], window: usize, hop: usize) -> Vec<f64> {
    if window == 0 || mono.len() < window {
        return Vec::new();
    }
    let count = 1 + (mono.len() - window) / hop;
    (0..count)
        .map(|k| {
            let frame = &mono[k * hop..k * hop + window];
            frame.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / window as f64
        })
        .collect()
}

/// Locate the active window of `signal`.
pub fn locate_active_window(
    signal: &AudioSignal,
    duration: f64,
    percentile: f64,
) -> Result<ActiveWindow, SegmentError> {
    if !(duration > 0.0) {
        return Err(SegmentError::InvalidDuration(duration));
    }
    if !(0.0..=100.0).contains(&percentile) {
        return Err(SegmentError::InvalidPercentile(percentile));
    }

    let window = window_frames(duration, signal.sample_rate());
    if window == 0 {
        return Err(SegmentError::InvalidDuration(duration));
    }
    let hop = (window / 4).max(1);

    let mono = signal.as_mono();
    let energies = frame_energies(mono.samples(), window, hop);
    if energies.is_empty() {
        return Err(SegmentError::TooShort {
            frames: signal.frames(),
            window,
        });
    }

    let target = stats::percentile(&energies, percentile);
    let mut best = 0;
    let mut best_diff = f64::INFINITY;
    for (k, &e) in energies.iter().enumerate() {
        let diff = (e - target).abs();
        if diff < best_diff {
            best = k;
            best_diff = diff;
        }
    }

    let start = best * hop;
    log::debug!(
        "Active window: frame {best}/{} at {:.2}s (energy {:.3e}, p{percentile} target {:.3e})",
        energies.len(),
        start as f64 / signal.sample_rate() as f64,
        energies[best],
        target
    );
    Ok(ActiveWindow {
        start,
        end: start + window,
    })
}

/// Fade-in gains for a ramp of `len` samples: `sin²` over `[0, π/2]`.
/// The matching fade-out is the same curve reversed (`cos²`).
pub fn fade_in_envelope(len: usize) -> Vec<f64> {
    match len {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => {
            let step = std::f64::consts::FRAC_PI_2 / (len - 1) as f64;
            (0..len).map(|i| (i as f64 * step).sin().powi(2)).collect()
        }
    }
}

/// Crop `signal` to `window` and apply raised-cosine ramps of `ramp_duration`
/// seconds at both ends.
pub fn segment(
    signal: &AudioSignal,
    window: ActiveWindow,
    ramp_duration: f64,
) -> Result<AudioSignal, SegmentError> {
    let mut out = signal.slice(window.start, window.end)?;

    let frames = out.frames();
    let ramp = ((ramp_duration.max(0.0) * signal.sample_rate() as f64).round() as usize)
        .min(frames / 2);
    let fade_in = fade_in_envelope(ramp);

    for (frame, &g) in out.frame_iter_mut().zip(&fade_in) {
        for s in frame {
            *s *= g as f32;
        }
    }
    // Fade-out: cos²(t) == 1 - sin²(t), walked forward over the last `ramp` frames
    let tail_start = frames - ramp;
    for (i, frame) in out.frame_iter_mut().enumerate().skip(tail_start) {
        let g = 1.0 - fade_in[i - tail_start];
        for s in frame {
            *s *= g as f32;
        }
    }

    Ok(out)
}
