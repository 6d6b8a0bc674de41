// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Pluggable strategy functions
//!
//! Metrics hold these as shared closures so that their parameters are fixed once, when
//! the metric is built.

pub mod normalise;
pub mod perturb;
pub mod quality;
pub mod similarity;

pub use normalise::NormaliseFn;
pub use perturb::{Baseline, NoiseType, PerturbFn, TextPerturbFn};
pub use quality::QualityFn;
pub use similarity::{NormFn, SimilarityFn};

use ndarray::ArrayD;
use std::sync::Arc;

/// Reduces per-instance scores to one value
pub type AggregateFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Arithmetic mean; NaN in, NaN out
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() || values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn aggregate_mean() -> AggregateFn {
    Arc::new(mean)
}

pub fn aggregate_nan_mean() -> AggregateFn {
    Arc::new(crate::utils::nan_mean)
}

/// Mean squared error between two arrays of equal size
pub fn mse(a: &ArrayD<f64>, b: &ArrayD<f64>, normalise_mse: bool) -> anyhow::Result<f64> {
    if a.len() != b.len() {
        anyhow::bail!("mse needs arrays of equal size, got {} and {}", a.len(), b.len());
    }
    let n = a.len().max(1) as f64;
    let total: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            if normalise_mse {
                x * x - 2.0 * x * y + y * y
            } else {
                (x - y) * (x - y)
            }
        })
        .sum();
    Ok(total / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mean_propagates_nan() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
        assert!(mean(&[1.0, f64::NAN]).is_nan());
        assert!(mean(&[]).is_nan());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_mse() {
        let a = array![1.0, 2.0].into_dyn();
        let b = array![1.0, 4.0].into_dyn();
        assert_eq!(mse(&a, &b, false).unwrap(), 2.0);
        assert_eq!(mse(&a, &b, true).unwrap(), 2.0);
    }
}
