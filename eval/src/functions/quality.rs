// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Intrinsic explanation quality measures
//!
//! These score an attribution on its own, without a reference attribution. The model
//! randomisation experiment uses them to grade explanations of a corrupted model.

use ndarray::ArrayD;
use std::sync::Arc;

/// `(a, x) -> quality` of one instance
pub type QualityFn = Arc<dyn Fn(&ArrayD<f64>, &ArrayD<f64>) -> anyhow::Result<f64> + Send + Sync>;

/// Gini coefficient of the absolute attribution values
///
/// 0 for a perfectly uniform attribution, approaching 1 as mass concentrates on one
/// position.
pub fn gini_coefficient(a: &ArrayD<f64>, _x: &ArrayD<f64>) -> anyhow::Result<f64> {
    let mut values: Vec<f64> = a.iter().map(|v| v.abs()).collect();
    if values.iter().any(|v| v.is_nan()) {
        anyhow::bail!("gini coefficient is undefined for NaN attributions");
    }
    values.sort_by(|x, y| x.total_cmp(y));
    let n = values.len() as f64;
    let total: f64 = values.iter().sum();
    if values.is_empty() || total == 0.0 {
        return Ok(0.0);
    }
    let weighted: f64 = values
        .iter()
        .enumerate()
        .map(|(i, v)| (2.0 * (i as f64 + 1.0) - n - 1.0) * v)
        .sum();
    Ok(weighted / (n * total))
}

/// Shannon entropy of the absolute attributions treated as a distribution
pub fn entropy(a: &ArrayD<f64>, _x: &ArrayD<f64>) -> anyhow::Result<f64> {
    let total: f64 = a.iter().map(|v| v.abs()).sum();
    if total == 0.0 {
        return Ok(0.0);
    }
    Ok(-a
        .iter()
        .map(|v| v.abs() / total)
        .filter(|p| *p > 0.0)
        .map(|p| p * p.ln())
        .sum::<f64>())
}

pub fn gini() -> QualityFn {
    Arc::new(gini_coefficient)
}
