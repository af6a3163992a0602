pub mod filter;
pub mod io;
pub mod loudness;
pub mod segment;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("WAV error for {path}: {source}")]
    Wav {
        path: String,
        source: hound::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Incompatible signals: {0}")]
    Incompatible(String),
    #[error("Invalid signal layout: {0}")]
    Layout(String),
    #[error("Range {start}..{end} outside signal of {frames} frames")]
    OutOfRange {
        start: usize,
        end: usize,
        frames: usize,
    },
    #[error("Nothing to mix")]
    Empty,
}

/// Convert a level in dB to a linear amplitude factor.
pub fn db_to_amp(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Convert a linear amplitude factor to dB. Zero maps to -inf.
pub fn amp_to_db(amp: f64) -> f64 {
    20.0 * amp.abs().log10()
}

/// A block of interleaved floating-point audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSignal {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl AudioSignal {
    /// Interleaved samples; the length must be a multiple of `channels`.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self, AudioError> {
        if channels == 0 {
            return Err(AudioError::Layout("zero channels".to_string()));
        }
        if sample_rate == 0 {
            return Err(AudioError::Layout("zero sample rate".to_string()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(AudioError::Layout(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn silence(frames: usize, channels: u16, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        Self {
            samples: vec![0.0; frames * channels as usize],
            channels,
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Iterate over frames as channel slices.
    pub fn frame_iter(&self) -> std::slice::ChunksExact<'_, f32> {
        self.samples.chunks_exact(self.channels as usize)
    }

    /// Mutable frame iterator.
    pub fn frame_iter_mut(&mut self) -> std::slice::ChunksExactMut<'_, f32> {
        self.samples.chunks_exact_mut(self.channels as usize)
    }

    /// One channel, de-interleaved.
    pub fn channel(&self, index: usize) -> Vec<f32> {
        self.frame_iter().map(|f| f[index]).collect()
    }

    /// Average of all channels.
    pub fn as_mono(&self) -> AudioSignal {
        if self.channels == 1 {
            return self.clone();
        }
        let n = self.channels as f32;
        let samples = self.frame_iter().map(|f| f.iter().sum::<f32>() / n).collect();
        AudioSignal {
            samples,
            channels: 1,
            sample_rate: self.sample_rate,
        }
    }

    /// Copy of frames `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> Result<AudioSignal, AudioError> {
        let frames = self.frames();
        if start > end || end > frames {
            return Err(AudioError::OutOfRange { start, end, frames });
        }
        let c = self.channels as usize;
        Ok(AudioSignal {
            samples: self.samples[start * c..end * c].to_vec(),
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }

    pub fn scale(&mut self, gain: f64) {
        let g = gain as f32;
        for s in &mut self.samples {
            *s *= g;
        }
    }

    pub fn scaled(&self, gain: f64) -> AudioSignal {
        let mut out = self.clone();
        out.scale(gain);
        out
    }

    /// Sign-inverted copy.
    pub fn inverted(&self) -> AudioSignal {
        self.scaled(-1.0)
    }

    fn check_compatible(&self, other: &AudioSignal) -> Result<(), AudioError> {
        if self.sample_rate != other.sample_rate {
            return Err(AudioError::Incompatible(format!(
                "sample rates {} and {}",
                self.sample_rate, other.sample_rate
            )));
        }
        if self.channels != other.channels {
            return Err(AudioError::Incompatible(format!(
                "{} and {} channels",
                self.channels, other.channels
            )));
        }
        if self.samples.len() != other.samples.len() {
            return Err(AudioError::Incompatible(format!(
                "{} and {} frames",
                self.frames(),
                other.frames()
            )));
        }
        Ok(())
    }

    /// `self += gain * other`, sample by sample.
    pub fn add_scaled(&mut self, other: &AudioSignal, gain: f64) -> Result<(), AudioError> {
        self.check_compatible(other)?;
        let g = gain as f32;
        for (a, b) in self.samples.iter_mut().zip(&other.samples) {
            *a += g * b;
        }
        Ok(())
    }

    /// `gain * self + other` as a new signal.
    pub fn mix(&self, gain: f64, other: &AudioSignal) -> Result<AudioSignal, AudioError> {
        let mut out = self.scaled(gain);
        out.add_scaled(other, 1.0)?;
        Ok(out)
    }

    /// Sample-wise sum of equally shaped signals.
    pub fn sum<'a, I>(signals: I) -> Result<AudioSignal, AudioError>
    where
        I: IntoIterator<Item = &'a AudioSignal>,
    {
        let mut iter = signals.into_iter();
        let mut acc = iter.next().ok_or(AudioError::Empty)?.clone();
        for s in iter {
            acc.add_scaled(s, 1.0)?;
        }
        Ok(acc)
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / self.samples.len() as f64).sqrt()
    }

    /// Integrated loudness in LUFS (ITU-R BS.1770).
    pub fn loudness(&self) -> f64 {
        loudness::integrated_loudness(self)
    }

    /// Scale so that the integrated loudness equals `target_lufs`.
    ///
    /// Returns the applied gain in dB, or `None` for signals with no
    /// measurable loudness, which are left untouched.
    pub fn set_loudness(&mut self, target_lufs: f64) -> Option<f64> {
        let measured = self.loudness();
        if !measured.is_finite() {
            log::warn!("Cannot normalize a silent signal to {target_lufs} LUFS");
            return None;
        }
        let gain_db = target_lufs - measured;
        self.scale(db_to_amp(gain_db));
        Some(gain_db)
    }
}
