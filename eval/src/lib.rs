// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Batched evaluation of attribution-based explanations
//!
//! This crate provides:
//! - A batched metric pipeline (preprocessing, mini-batching, post-processing, aggregation)
//! - Faithfulness metrics (ROAD, Token Flipping)
//! - Robustness metrics (Local Lipschitz Estimate, Relative Input/Output/Representation
//!   Stability, Avg-Sensitivity) with a prediction-change guard
//! - The model parameter randomisation experiment with guaranteed weight restoration
//! - Inverse estimation over any batched metric
//! - Capability traits for numeric and text classifiers, plus small reference models
//! - Reproducible evaluation with seeded randomness

pub mod asserts;
pub mod config;
pub mod data;
pub mod error;
pub mod explain;
pub mod functions;
pub mod inverse;
pub mod metrics;
pub mod model;
pub mod perturbation;
pub mod pipeline;
pub mod randomisation;
pub mod reference;
pub mod text;
pub mod utils;

pub use config::{InverseMethod, Kwargs, LayerOrder, MetricConfig};
pub use data::{AttributionBatch, InputBatch};
pub use error::{Result, XaiError};
pub use explain::Explainer;
pub use inverse::{invert_attributions, InverseEstimation, InverseParams};
pub use metrics::{
    AvgSensitivity, AvgSensitivityParams, FlipTask, LocalLipschitzEstimate, LocalLipschitzParams, RelativeStability,
    RelativeStabilityParams, Road, RoadParams, StabilityKind, TokenFlipping, TokenFlippingParams,
};
pub use model::{Classifier, LayerSelection, ModelInterface, StateDict};
pub use perturbation::PerturbationGuard;
pub use pipeline::{BatchedMetric, EvalInput, MetricOutput, ModelRef, Score};
pub use randomisation::{LayerRandomisation, ModelParameterRandomisation, RandomisationOutput, RandomisationParams};
pub use text::{TextClassifier, TokenAttribution, Tokenizer};
