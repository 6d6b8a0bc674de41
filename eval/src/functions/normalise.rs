// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Attribution normalisation strategies
//!
//! Every function takes a batch (instances along axis 0) and normalises each instance
//! on its own.

use ndarray::{ArrayD, Axis};
use std::sync::Arc;

/// Batch normalisation strategy
pub type NormaliseFn = Arc<dyn Fn(&ArrayD<f64>) -> anyhow::Result<ArrayD<f64>> + Send + Sync>;

fn per_instance(a: &ArrayD<f64>, f: impl Fn(&mut ndarray::ArrayViewMutD<f64>)) -> ArrayD<f64> {
    let mut out = a.clone();
    if out.ndim() == 0 {
        return out;
    }
    for mut instance in out.axis_iter_mut(Axis(0)) {
        f(&mut instance);
    }
    out
}

/// Divide by the largest absolute value
pub fn normalise_by_max(a: &ArrayD<f64>) -> anyhow::Result<ArrayD<f64>> {
    Ok(per_instance(a, |instance| {
        let max = instance.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if max > 0.0 {
            instance.mapv_inplace(|v| v / max);
        }
    }))
}

/// Scale positive values by the maximum and negative values by the magnitude of the minimum
pub fn normalise_by_negative(a: &ArrayD<f64>) -> anyhow::Result<ArrayD<f64>> {
    Ok(per_instance(a, |instance| {
        let max = instance.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = instance.iter().cloned().fold(f64::INFINITY, f64::min);
        instance.mapv_inplace(|v| {
            if v > 0.0 && max > 0.0 {
                v / max
            } else if v < 0.0 && min < 0.0 {
                v / min.abs()
            } else {
                v
            }
        });
    }))
}

/// Divide by the square root of the mean squared value
pub fn normalise_by_average_second_moment_estimate(a: &ArrayD<f64>) -> anyhow::Result<ArrayD<f64>> {
    Ok(per_instance(a, |instance| {
        let n = instance.len().max(1) as f64;
        let second_moment = instance.iter().map(|v| v * v).sum::<f64>() / n;
        let scale = second_moment.sqrt();
        if scale > 0.0 {
            instance.mapv_inplace(|v| v / scale);
        }
    }))
}

/// Divide by the sum of absolute values
pub fn normalise_sum_to_one(a: &ArrayD<f64>) -> anyhow::Result<ArrayD<f64>> {
    Ok(per_instance(a, |instance| {
        let total: f64 = instance.iter().map(|v| v.abs()).sum();
        if total > 0.0 {
            instance.mapv_inplace(|v| v / total);
        }
    }))
}

pub fn by_max() -> NormaliseFn {
    Arc::new(normalise_by_max)
}

pub fn by_negative() -> NormaliseFn {
    Arc::new(normalise_by_negative)
}

pub fn by_second_moment() -> NormaliseFn {
    Arc::new(normalise_by_average_second_moment_estimate)
}

pub fn sum_to_one() -> NormaliseFn {
    Arc::new(normalise_sum_to_one)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    #[test]
    fn test_normalise_by_max() {
        let a = array![[1.0, 2.0, 3.0, 4.0, 4.0, 5.0, -1.0]].into_dyn();
        let n = normalise_by_max(&a).unwrap();
        let expected = array![[0.2, 0.4, 0.6, 0.8, 0.8, 1.0, -0.2]].into_dyn();
        for (x, y) in n.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_normalise_per_instance() {
        let a = array![[1.0, 2.0], [10.0, 5.0]].into_dyn();
        let n = normalise_by_max(&a).unwrap();
        assert_eq!(n, array![[0.5, 1.0], [1.0, 0.5]].into_dyn());
    }

    #[test]
    fn test_normalise_by_negative() {
        let a = array![[1.0, 2.0, 3.0, 4.0, 5.0]].into_dyn();
        let n = normalise_by_negative(&a).unwrap();
        assert_abs_diff_eq!(n[[0, 0]], 0.2, epsilon = 1e-12);
        let mixed = array![[4.0, -2.0, 0.0, -1.0]].into_dyn();
        let n = normalise_by_negative(&mixed).unwrap();
        assert_eq!(n, array![[1.0, -1.0, 0.0, -0.5]].into_dyn());
    }

    #[test]
    fn test_zero_attributions_untouched() {
        let a = Array::zeros(ndarray::IxDyn(&[3, 2, 2]));
        assert_eq!(normalise_by_max(&a).unwrap(), a);
        assert_eq!(normalise_by_average_second_moment_estimate(&a).unwrap(), a);
    }

    #[test]
    fn test_sum_to_one() {
        let a = array![[1.0, -3.0]].into_dyn();
        assert_eq!(normalise_sum_to_one(&a).unwrap(), array![[0.25, -0.75]].into_dyn());
    }
}
