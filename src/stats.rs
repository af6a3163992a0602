//! Order statistics over score columns.
//!
//! Quantiles use linear interpolation between closest ranks, which is what
//! numpy/pandas/R (type 7) report by default. NaN values are ignored.

/// Sorted copy of the finite values in `values`.
fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| !x.is_nan()).collect();
    v.sort_by(|a, b| a.total_cmp(b));
    v
}

/// Quantile of already-sorted data. `q` is clamped to [0, 1].
/// Returns NaN for empty input.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Quantile with linear interpolation (`q` in [0, 1]).
pub fn quantile(values: &[f64], q: f64) -> f64 {
    quantile_sorted(&sorted_finite(values), q)
}

/// Percentile with linear interpolation (`p` in [0, 100]).
pub fn percentile(values: &[f64], p: f64) -> f64 {
    quantile(values, p / 100.0)
}

pub fn median(values: &[f64]) -> f64 {
    quantile(values, 0.5)
}

/// Q3 - Q1.
pub fn interquartile_range(values: &[f64]) -> f64 {
    let sorted = sorted_finite(values);
    quantile_sorted(&sorted, 0.75) - quantile_sorted(&sorted, 0.25)
}

/// Tukey fences at 1.5 × IQR.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fences {
    pub low: f64,
    pub high: f64,
}

impl Fences {
    pub fn from_values(values: &[f64]) -> Self {
        let sorted = sorted_finite(values);
        let q1 = quantile_sorted(&sorted, 0.25);
        let q3 = quantile_sorted(&sorted, 0.75);
        let iqr = q3 - q1;
        Self {
            low: q1 - 1.5 * iqr,
            high: q3 + 1.5 * iqr,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }
}

/// Outlier mask, aligned with `values`: true where a value falls outside the
/// Tukey fences. NaN is never flagged.
pub fn is_outlier(values: &[f64]) -> Vec<bool> {
    let fences = Fences::from_values(values);
    values
        .iter()
        .map(|&v| !v.is_nan() && !fences.contains(v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_quantile_linear_interpolation() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!(close(quantile(&v, 0.25), 1.75));
        assert!(close(quantile(&v, 0.5), 2.5));
        assert!(close(quantile(&v, 0.75), 3.25));
        assert!(close(quantile(&v, 0.0), 1.0));
        assert!(close(quantile(&v, 1.0), 4.0));
    }

    #[test]
    fn test_quantile_unsorted_input() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert!(close(median(&v), 2.5));
        assert!(close(percentile(&v, 75.0), 3.25));
    }

    #[test]
    fn test_quantile_empty_and_single() {
        assert!(quantile(&[], 0.5).is_nan());
        assert!(close(quantile(&[7.0], 0.9), 7.0));
    }

    #[test]
    fn test_nan_ignored() {
        let v = [1.0, f64::NAN, 3.0];
        assert!(close(median(&v), 2.0));
    }

    #[test]
    fn test_interquartile_range() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        // Q1 = 2, Q3 = 4
        assert!(close(interquartile_range(&v), 2.0));
    }

    #[test]
    fn test_single_injected_outlier_flagged() {
        let mut v: Vec<f64> = (0..20).map(|i| 5.0 + 0.1 * i as f64).collect();
        v.insert(7, 40.0);
        let mask = is_outlier(&v);
        let flagged: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged, vec![7]);
    }

    #[test]
    fn test_low_outlier_flagged() {
        let v = [10.0, 10.5, 11.0, 11.5, 12.0, -30.0];
        let mask = is_outlier(&v);
        assert_eq!(mask, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn test_no_outliers_in_uniform_data() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert!(is_outlier(&v).iter().all(|m| !m));
    }
}
