// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Batched explanation-quality metrics
//!
//! Implements:
//! - Faithfulness: ROAD, Token Flipping
//! - Robustness: Local Lipschitz Estimate, Relative Input/Output/Representation Stability,
//!   Avg-Sensitivity
//!
//! Every metric implements [`crate::pipeline::BatchedMetric`] and is called through
//! `BatchedMetric::call`.

pub mod avg_sensitivity;
pub mod local_lipschitz;
pub mod relative_stability;
pub mod road;
pub mod token_flipping;

pub use avg_sensitivity::{AvgSensitivity, AvgSensitivityParams};
pub use local_lipschitz::{LocalLipschitzEstimate, LocalLipschitzParams};
pub use relative_stability::{RelativeStability, RelativeStabilityParams, StabilityKind};
pub use road::{Road, RoadParams};
pub use token_flipping::{FlipTask, TokenFlipping, TokenFlippingParams};

use crate::error::Result;
use ndarray::{Array2, ArrayD};

/// View a batch as (batch, features)
pub(crate) fn flatten_rows(x: &ArrayD<f64>) -> Result<Array2<f64>> {
    let n = x.shape().first().copied().unwrap_or(0);
    let features = if n == 0 { 0 } else { x.len() / n };
    Ok(x.as_standard_layout().into_owned().into_shape((n, features))?)
}
