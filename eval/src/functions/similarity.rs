// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Norms and similarity measures between attributions and inputs

use ndarray::ArrayD;
use std::sync::Arc;

/// Norm of one flattened instance
pub type NormFn = Arc<dyn Fn(&ArrayD<f64>) -> f64 + Send + Sync>;

/// `(a, a_perturbed, x, x_perturbed) -> similarity`
pub type SimilarityFn =
    Arc<dyn Fn(&ArrayD<f64>, &ArrayD<f64>, &ArrayD<f64>, &ArrayD<f64>) -> anyhow::Result<f64> + Send + Sync>;

pub fn l2_norm(a: &ArrayD<f64>) -> f64 {
    a.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Frobenius norm; equal to the L2 norm of the flattened array
pub fn fro_norm(a: &ArrayD<f64>) -> f64 {
    l2_norm(a)
}

pub fn linf_norm(a: &ArrayD<f64>) -> f64 {
    a.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

pub fn distance_euclidean(a: &ArrayD<f64>, b: &ArrayD<f64>) -> anyhow::Result<f64> {
    if a.len() != b.len() {
        anyhow::bail!("cannot compare arrays of {} and {} elements", a.len(), b.len());
    }
    Ok(a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt())
}

/// Element-wise difference `a - b` over the flattened arrays
pub fn difference(a: &ArrayD<f64>, b: &ArrayD<f64>) -> anyhow::Result<ArrayD<f64>> {
    if a.shape() != b.shape() {
        anyhow::bail!("cannot subtract arrays of shape {:?} and {:?}", b.shape(), a.shape());
    }
    Ok(a - b)
}

/// Ratio of the attribution distance to the input distance
///
/// Returns infinity for a nonzero attribution change on an unchanged input and zero when
/// neither changed.
pub fn lipschitz_constant(
    a: &ArrayD<f64>,
    a_perturbed: &ArrayD<f64>,
    x: &ArrayD<f64>,
    x_perturbed: &ArrayD<f64>,
) -> anyhow::Result<f64> {
    let numerator = distance_euclidean(a, a_perturbed)?;
    let denominator = distance_euclidean(x, x_perturbed)?;
    if denominator == 0.0 {
        return Ok(if numerator == 0.0 { 0.0 } else { f64::INFINITY });
    }
    Ok(numerator / denominator)
}

pub fn lipschitz() -> SimilarityFn {
    Arc::new(lipschitz_constant)
}

pub fn fro() -> NormFn {
    Arc::new(fro_norm)
}
