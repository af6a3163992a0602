use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use super::{AudioError, AudioSignal};

fn wav_error(path: &Path, source: hound::Error) -> AudioError {
    AudioError::Wav {
        path: path.display().to_string(),
        source,
    }
}

/// Decode a WAV file. Integer PCM is scaled to [-1, 1).
pub fn read_wav(path: &Path) -> Result<AudioSignal, AudioError> {
    let mut reader = WavReader::open(path).map_err(|e| wav_error(path, e))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| wav_error(path, e))?,
        SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / max_value))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| wav_error(path, e))?
        }
    };

    log::trace!(
        "Read {} ({} ch, {} Hz, {} frames)",
        path.display(),
        spec.channels,
        spec.sample_rate,
        samples.len() / spec.channels.max(1) as usize
    );
    AudioSignal::new(samples, spec.channels, spec.sample_rate)
}

/// Read and optionally fold to mono.
pub fn read_wav_as(path: &Path, force_mono: bool) -> Result<AudioSignal, AudioError> {
    let signal = read_wav(path)?;
    Ok(if force_mono { signal.as_mono() } else { signal })
}

/// Write 32-bit float WAV without touching the level.
pub fn write_wav_raw(signal: &AudioSignal, path: &Path) -> Result<(), AudioError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let spec = WavSpec {
        channels: signal.channels(),
        sample_rate: signal.sample_rate(),
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).map_err(|e| wav_error(path, e))?;
    for &s in signal.samples() {
        writer.write_sample(s).map_err(|e| wav_error(path, e))?;
    }
    writer.finalize().map_err(|e| wav_error(path, e))?;
    Ok(())
}

/// Normalize a copy of `signal` to `target_loudness` LUFS and write it.
/// Normalization is always the last operation before emission.
pub fn write_wav(
    signal: &AudioSignal,
    path: &Path,
    target_loudness: f64,
) -> Result<(), AudioError> {
    let mut out = signal.clone();
    out.set_loudness(target_loudness);
    if out.peak() > 1.0 {
        log::debug!(
            "{} peaks at {:.2} dBFS after loudness normalization",
            path.display(),
            super::amp_to_db(out.peak() as f64)
        );
    }
    write_wav_raw(&out, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.wav");
        let s = AudioSignal::new(vec![0.5, -0.5, 0.25, -0.25], 2, 22050).unwrap();
        write_wav_raw(&s, &path).unwrap();

        let back = read_wav(&path).unwrap();
        assert_eq!(back, s);
        assert_eq!(read_wav_as(&path, true).unwrap().samples(), &[0.0, 0.0]);
    }

    #[test]
    fn test_int16_is_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i16.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(&path, spec).unwrap();
        for v in [0i16, 16384, -32768] {
            w.write_sample(v).unwrap();
        }
        w.finalize().unwrap();

        let s = read_wav(&path).unwrap();
        assert_eq!(s.samples(), &[0.0, 0.5, -1.0]);
        assert_eq!(s.sample_rate(), 8000);
    }

    #[test]
    fn test_write_normalizes_loudness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let sr = 44100;
        let s = AudioSignal::mono(
            (0..sr)
                .map(|i| {
                    (0.1 * (2.0 * std::f64::consts::PI * 440.0 * i as f64 / sr as f64).sin()) as f32
                })
                .collect(),
            sr as u32,
        );
        write_wav(&s, &path, -26.0).unwrap();
        let back = read_wav(&path).unwrap();
        assert!((back.loudness() + 26.0).abs() < 1e-3);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = read_wav(Path::new("/nonexistent/x.wav")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/x.wav"));
    }
}
