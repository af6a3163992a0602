//! Dispersion sampling: pick `size` values spread as evenly as possible across
//! the range of a population.
//!
//! The values are sorted and scanned greedily: the smallest value is always
//! kept, and every later value at least `step` above the last kept one is kept
//! too. `step` starts at the ideal spacing `(max - min) / (size - 1)` and is
//! nudged by a factor of `1 + alpha` (up when too many values survive, down
//! when too few) until exactly `size` values survive or the iteration budget
//! runs out. The kept count is non-increasing in `step`, so the search only
//! ever moves towards the requested size.

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SamplingError {
    #[error("Sample size must be at least 1")]
    ZeroSize,
    #[error("Cannot sample from an empty population")]
    Empty,
    #[error("Population contains a non-finite value at position {0}")]
    NonFinite(usize),
    #[error("All {count} values are identical ({value}); no spread to sample {size} from")]
    Degenerate { count: usize, value: f64, size: usize },
}

/// Search parameters for [`disperse`].
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DispersionConfig {
    /// Relative step adjustment per iteration.
    pub alpha: f64,
    /// Iterations before settling for the closest count seen.
    pub max_iterations: usize,
}

impl Default for DispersionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            max_iterations: 1000,
        }
    }
}

/// The sampler could not hit the requested size exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeDrift {
    pub requested: usize,
    pub actual: usize,
}

impl std::fmt::Display for SizeDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "approximate sample size: requested {}, got {}",
            self.requested, self.actual
        )
    }
}

/// Result of a dispersion sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispersion {
    /// Positions in the caller's slice, ordered by ascending value.
    pub indices: Vec<usize>,
    /// The selected values, ascending.
    pub values: Vec<f64>,
    /// Set when the returned size differs from the requested one.
    pub drift: Option<SizeDrift>,
    /// Spacing threshold the search finished on.
    pub step: f64,
    pub iterations: usize,
}

impl Dispersion {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Select `size` maximally spread values from `values`.
///
/// Ties in the input are broken by original position, so the result is fully
/// determined by the input order and values.
pub fn disperse(
    values: &[f64],
    size: usize,
    config: &DispersionConfig,
) -> Result<Dispersion, SamplingError> {
    if size == 0 {
        return Err(SamplingError::ZeroSize);
    }
    if values.is_empty() {
        return Err(SamplingError::Empty);
    }
    if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
        return Err(SamplingError::NonFinite(pos));
    }

    // Stable sort keeps equal values in input order.
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let sorted: Vec<f64> = order.iter().map(|&i| values[i]).collect();

    if size == 1 {
        return Ok(finish(&order, &sorted, vec![0], size, 0.0, 0));
    }

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    if max == min {
        return Err(SamplingError::Degenerate {
            count: values.len(),
            value: min,
            size,
        });
    }

    let factor = 1.0 + config.alpha;
    let mut step = (max - min) / (size - 1) as f64;
    let mut best: Option<(Vec<usize>, f64)> = None;
    let mut iterations = 0;

    while iterations < config.max_iterations {
        iterations += 1;
        let kept = greedy_scan(&sorted, step);

        if kept.len() == size {
            return Ok(finish(&order, &sorted, kept, size, step, iterations));
        }

        let closer = match &best {
            Some((b, _)) => kept.len().abs_diff(size) < b.len().abs_diff(size),
            None => true,
        };
        let too_many = kept.len() > size;
        if closer {
            best = Some((kept, step));
        }

        if too_many {
            step *= factor;
        } else {
            step /= factor;
        }
    }

    let (kept, step) = match best {
        Some(b) => b,
        None => (greedy_scan(&sorted, step), step),
    };
    let result = finish(&order, &sorted, kept, size, step, iterations);
    if let Some(drift) = result.drift {
        log::warn!("Dispersion sampling did not converge in {iterations} iterations: {drift}");
    }
    Ok(result)
}

/// Indices (into `sorted`) kept when enforcing a minimum spacing of `step`.
fn greedy_scan(sorted: &[f64], step: f64) -> Vec<usize> {
    let mut kept = vec![0];
    let mut last = sorted[0];
    for (i, &v) in sorted.iter().enumerate().skip(1) {
        if v - last >= step {
            kept.push(i);
            last = v;
        }
    }
    kept
}

fn finish(
    order: &[usize],
    sorted: &[f64],
    kept: Vec<usize>,
    size: usize,
    step: f64,
    iterations: usize,
) -> Dispersion {
    let drift = (kept.len() != size).then_some(SizeDrift {
        requested: size,
        actual: kept.len(),
    });
    Dispersion {
        indices: kept.iter().map(|&k| order[k]).collect(),
        values: kept.iter().map(|&k| sorted[k]).collect(),
        drift,
        step,
        iterations,
    }
}
