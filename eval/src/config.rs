// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Shared metric configuration
//!
//! Every metric owns one [`MetricConfig`] plus its own parameter struct. Both are
//! resolved once at construction; nothing here changes while a metric is being called.

use crate::error::{Result, XaiError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Keyword arguments forwarded to explain functions and model forward passes
pub type Kwargs = serde_json::Map<String, serde_json::Value>;

/// Options common to all metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Take the absolute value of attributions after normalisation
    pub abs: bool,
    /// Apply the metric's normalisation function to attributions
    pub normalise: bool,
    /// Collapse per-instance scores with the aggregation function
    pub return_aggregate: bool,
    /// Suppress parameterisation warnings
    pub disable_warnings: bool,
    /// Draw a progress bar over mini-batches
    pub display_progressbar: bool,
    /// Seed for every stochastic step of a call
    pub seed: u64,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            abs: false,
            normalise: true,
            return_aggregate: false,
            disable_warnings: false,
            display_progressbar: false,
            seed: 42,
        }
    }
}

impl MetricConfig {
    pub fn with_abs(mut self, abs: bool) -> Self {
        self.abs = abs;
        self
    }

    pub fn with_normalise(mut self, normalise: bool) -> Self {
        self.normalise = normalise;
        self
    }

    pub fn with_return_aggregate(mut self, return_aggregate: bool) -> Self {
        self.return_aggregate = return_aggregate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_progressbar(mut self, display: bool) -> Self {
        self.display_progressbar = display;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.disable_warnings = true;
        self
    }
}

/// Log a parameterisation warning unless warnings are disabled
pub(crate) fn warn_parameterisation(config: &MetricConfig, metric: &str, sensitive_to: &str) {
    if config.disable_warnings {
        return;
    }
    tracing::warn!(
        "The {} metric is likely to be sensitive to the choice of {}. \
         Go over and select each hyperparameter of the metric carefully to avoid \
         misinterpretation of scores. Set disable_warnings to silence this message.",
        metric,
        sensitive_to
    );
}

/// Order in which layers are randomised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerOrder {
    /// Output-side layer first, cumulative
    TopDown,
    /// Input-side layer first, cumulative
    BottomUp,
    /// One layer at a time, original weights restored in between
    Independent,
}

impl Default for LayerOrder {
    fn default() -> Self {
        LayerOrder::BottomUp
    }
}

impl LayerOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerOrder::TopDown => "top_down",
            LayerOrder::BottomUp => "bottom_up",
            LayerOrder::Independent => "independent",
        }
    }

    pub fn is_cumulative(&self) -> bool {
        !matches!(self, LayerOrder::Independent)
    }
}

impl fmt::Display for LayerOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerOrder {
    type Err = XaiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "top_down" => Ok(LayerOrder::TopDown),
            "bottom_up" => Ok(LayerOrder::BottomUp),
            "independent" => Ok(LayerOrder::Independent),
            other => Err(XaiError::config(
                "layer_order",
                format!(
                    "'{}' is not one of 'top_down', 'bottom_up', 'independent'",
                    other
                ),
            )),
        }
    }
}

/// How attributions are inverted by the inverse-estimation experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverseMethod {
    #[serde(rename = "sign-flip")]
    SignFlip,
    #[serde(rename = "value-swap")]
    ValueSwap,
}

impl Default for InverseMethod {
    fn default() -> Self {
        InverseMethod::SignFlip
    }
}

impl FromStr for InverseMethod {
    type Err = XaiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sign-flip" => Ok(InverseMethod::SignFlip),
            "value-swap" => Ok(InverseMethod::ValueSwap),
            other => Err(XaiError::config(
                "inverse_method",
                format!("'{}' is not one of 'sign-flip', 'value-swap'", other),
            )),
        }
    }
}
