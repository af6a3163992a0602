//! Second-order IIR sections.

use std::f64::consts::PI;

/// Biquad section, Direct Form II transposed, `a0` normalized to 1.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn new(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0,
            b1,
            b2,
            a1,
            a2,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// BS.1770 stage 1: high shelf modelling the acoustic effect of the head.
    pub fn k_shelf(sample_rate: f64) -> Self {
        let f0 = 1681.974_450_955_533;
        let gain_db = 3.999_843_853_973_347;
        let q = 0.707_175_236_955_419_6;

        let k = (PI * f0 / sample_rate).tan();
        let vh = 10f64.powf(gain_db / 20.0);
        let vb = vh.powf(0.499_666_774_154_541_6);
        let a0 = 1.0 + k / q + k * k;

        Self::new(
            (vh + vb * k / q + k * k) / a0,
            2.0 * (k * k - vh) / a0,
            (vh - vb * k / q + k * k) / a0,
            2.0 * (k * k - 1.0) / a0,
            (1.0 - k / q + k * k) / a0,
        )
    }

    /// BS.1770 stage 2: revised low-frequency B-curve (high-pass).
    pub fn k_high_pass(sample_rate: f64) -> Self {
        let f0 = 38.135_470_876_024_44;
        let q = 0.500_327_037_323_877_3;

        let k = (PI * f0 / sample_rate).tan();
        let a0 = 1.0 + k / q + k * k;

        Self::new(
            1.0,
            -2.0,
            1.0,
            2.0 * (k * k - 1.0) / a0,
            (1.0 - k / q + k * k) / a0,
        )
    }

    /// Butterworth low-pass (RBJ cookbook, Q = 1/√2).
    pub fn low_pass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * std::f64::consts::FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;

        Self::new(
            (1.0 - cos_w0) / 2.0 / a0,
            (1.0 - cos_w0) / a0,
            (1.0 - cos_w0) / 2.0 / a0,
            -2.0 * cos_w0 / a0,
            (1.0 - alpha) / a0,
        )
    }

    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_state_gain(mut f: Biquad, freq: f64, sr: f64) -> f64 {
        let n = sr as usize;
        let mut peak: f64 = 0.0;
        for i in 0..n {
            let y = f.process((2.0 * PI * freq * i as f64 / sr).sin());
            if i > n / 2 {
                peak = peak.max(y.abs());
            }
        }
        peak
    }

    #[test]
    fn test_low_pass_response() {
        let sr = 44100.0;
        let pass = steady_state_gain(Biquad::low_pass(3500.0, sr), 200.0, sr);
        let corner = steady_state_gain(Biquad::low_pass(3500.0, sr), 3500.0, sr);
        let stop = steady_state_gain(Biquad::low_pass(3500.0, sr), 15000.0, sr);
        assert!((pass - 1.0).abs() < 0.01);
        assert!((corner - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.02);
        assert!(stop < 0.1);
    }

    #[test]
    fn test_k_weighting_shapes() {
        let sr = 48000.0;
        // Shelf lifts highs by ~4 dB
        let hi = steady_state_gain(Biquad::k_shelf(sr), 10000.0, sr);
        assert!((20.0 * hi.log10() - 4.0).abs() < 0.3);
        // RLB high-pass removes sub-bass
        let lo = steady_state_gain(Biquad::k_high_pass(sr), 10.0, sr);
        assert!(lo < 0.2);
    }
}
