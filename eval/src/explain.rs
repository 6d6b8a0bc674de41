// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Explanation functions
//!
//! Attribution methods (gradients, SHAP, LIME, ...) live outside this crate. Metrics call
//! them through the signatures below.

use crate::config::{InverseMethod, Kwargs};
use crate::model::Classifier;
use crate::text::{TextClassifier, TextInput, TokenAttribution};
use ndarray::{ArrayD, IxDyn};
use std::fmt;
use std::sync::Arc;

/// `(model, x_batch, y_batch, kwargs) -> attributions` for numeric models
pub type ExplainFn =
    Arc<dyn Fn(&dyn Classifier, &ArrayD<f64>, &[usize], &Kwargs) -> anyhow::Result<ArrayD<f64>> + Send + Sync>;

/// `(model, text, y_batch, kwargs) -> token attributions` for text classifiers
pub type TextExplainFn = Arc<
    dyn Fn(&dyn TextClassifier, TextInput<'_>, &[usize], &Kwargs) -> anyhow::Result<Vec<TokenAttribution>>
        + Send
        + Sync,
>;

/// An explanation function for one model modality
#[derive(Clone)]
pub enum Explainer {
    Numeric(ExplainFn),
    Text(TextExplainFn),
}

impl fmt::Debug for Explainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Explainer::Numeric(_) => f.write_str("Explainer::Numeric"),
            Explainer::Text(_) => f.write_str("Explainer::Text"),
        }
    }
}

impl Explainer {
    pub fn numeric<F>(f: F) -> Self
    where
        F: Fn(&dyn Classifier, &ArrayD<f64>, &[usize], &Kwargs) -> anyhow::Result<ArrayD<f64>>
            + Send
            + Sync
            + 'static,
    {
        Explainer::Numeric(Arc::new(f))
    }

    pub fn text<F>(f: F) -> Self
    where
        F: Fn(&dyn TextClassifier, TextInput<'_>, &[usize], &Kwargs) -> anyhow::Result<Vec<TokenAttribution>>
            + Send
            + Sync
            + 'static,
    {
        Explainer::Text(Arc::new(f))
    }

    /// The same explainer with its output inverted by `method`
    pub fn inverted(&self, method: InverseMethod) -> Explainer {
        match self {
            Explainer::Numeric(inner) => {
                let inner = Arc::clone(inner);
                Explainer::numeric(move |model: &dyn Classifier, x: &ArrayD<f64>, y: &[usize], kwargs: &Kwargs| {
                    let a = inner(model, x, y, kwargs)?;
                    Ok(crate::inverse::invert_attributions(&a, method))
                })
            }
            Explainer::Text(inner) => {
                let inner = Arc::clone(inner);
                Explainer::text(move |model: &dyn TextClassifier, x: TextInput<'_>, y: &[usize], kwargs: &Kwargs| {
                    let a = inner(model, x, y, kwargs)?;
                    a.into_iter()
                        .map(|t| -> anyhow::Result<TokenAttribution> {
                            let len = t.scores.len();
                            let row = t.scores.into_shape(IxDyn(&[1, len]))?;
                            let scores = crate::inverse::invert_attributions(&row, method).into_shape(len)?;
                            Ok(TokenAttribution::new(t.tokens, scores))
                        })
                        .collect()
                })
            }
        }
    }
}
