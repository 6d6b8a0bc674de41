// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Perturbation and the prediction-change guard shared by the robustness metrics

use crate::asserts::assert_plain_text_perturbation_requires_text_model;
use crate::error::{Result, XaiError};
use crate::functions::{PerturbFn, TextPerturbFn};
use crate::pipeline::{Score, WrappedModel};
use crate::utils::{argmax_rows, instance, stack_instances};
use ndarray::{Array2, Array3, ArrayD};
use rand_chacha::ChaCha8Rng;

/// A perturbation strategy for one input modality
#[derive(Clone)]
pub enum Perturbation {
    /// Numeric tensors and token embeddings
    Numeric(PerturbFn),
    /// Whole strings, for text classifiers only
    PlainText(TextPerturbFn),
}

impl Perturbation {
    pub fn is_plain_text(&self) -> bool {
        matches!(self, Perturbation::PlainText(_))
    }
}

impl std::fmt::Debug for Perturbation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Perturbation::Numeric(_) => f.write_str("Perturbation::Numeric"),
            Perturbation::PlainText(_) => f.write_str("Perturbation::PlainText"),
        }
    }
}

/// An input as handed to the guard
#[derive(Debug, Clone, Copy)]
pub enum InputView<'a> {
    Numeric(&'a ArrayD<f64>),
    Text(&'a [String]),
    Embeddings {
        embeddings: &'a Array3<f64>,
        attention_mask: &'a [Vec<u8>],
    },
}

/// Perturbs batches and reports instances whose predicted class changed
#[derive(Clone, Debug)]
pub struct PerturbationGuard {
    pub perturbation: Perturbation,
    pub nr_samples: usize,
    pub return_nan_when_prediction_changes: bool,
}

impl PerturbationGuard {
    pub fn new(perturbation: Perturbation, nr_samples: usize, return_nan_when_prediction_changes: bool) -> Self {
        Self {
            perturbation,
            nr_samples,
            return_nan_when_prediction_changes,
        }
    }

    /// Plain-text strategies can only drive text classifiers
    pub fn check_model(&self, model: &WrappedModel<'_>) -> Result<()> {
        assert_plain_text_perturbation_requires_text_model(self.perturbation.is_plain_text(), model.is_text())
    }

    fn numeric_fn(&self) -> Result<&PerturbFn> {
        match &self.perturbation {
            Perturbation::Numeric(f) => Ok(f),
            Perturbation::PlainText(_) => Err(XaiError::Unsupported(
                "a plain-text perturbation cannot perturb numeric arrays".to_string(),
            )),
        }
    }

    /// Perturb every position of every instance; same shape out
    pub fn perturb_batch(&self, x: &ArrayD<f64>, rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>> {
        let f = self.numeric_fn()?;
        let n = x.shape().first().copied().unwrap_or(0);
        let mut perturbed = Vec::with_capacity(n);
        for i in 0..n {
            let xi = instance(x, i);
            let axes: Vec<usize> = (0..xi.ndim()).collect();
            let indices: Vec<usize> = (0..xi.len()).collect();
            perturbed.push(f(&xi, &indices, &axes, rng)?);
        }
        stack_instances(&perturbed)
    }

    /// Perturb token embeddings (batch, tokens, dim) in embedding space
    pub fn perturb_embeddings(&self, embeddings: &Array3<f64>, rng: &mut ChaCha8Rng) -> Result<Array3<f64>> {
        let perturbed = self.perturb_batch(&embeddings.clone().into_dyn(), rng)?;
        Ok(perturbed.into_dimensionality()?)
    }

    pub fn perturb_text(&self, x: &[String], rng: &mut ChaCha8Rng) -> Result<Vec<String>> {
        match &self.perturbation {
            Perturbation::PlainText(f) => {
                let out = f(x, rng)?;
                if out.len() != x.len() {
                    return Err(XaiError::shape(x.len(), out.len()));
                }
                Ok(out)
            }
            Perturbation::Numeric(_) => Err(XaiError::Unsupported(
                "a numeric perturbation cannot perturb plain text; perturb the embeddings instead".to_string(),
            )),
        }
    }

    /// Indices whose argmax prediction differs between `x` and `x_perturbed`
    ///
    /// Empty when the guard is switched off.
    pub fn changed_prediction_indices(
        &self,
        model: &WrappedModel<'_>,
        x: InputView<'_>,
        x_perturbed: InputView<'_>,
    ) -> Result<Vec<usize>> {
        if !self.return_nan_when_prediction_changes {
            return Ok(Vec::new());
        }
        let before = argmax_rows(&predict_view(model, x)?);
        let after = argmax_rows(&predict_view(model, x_perturbed)?);
        if before.len() != after.len() {
            return Err(XaiError::shape(before.len(), after.len()));
        }
        Ok(before
            .iter()
            .zip(&after)
            .enumerate()
            .filter(|(_, (b, a))| b != a)
            .map(|(i, _)| i)
            .collect())
    }
}

fn predict_view(model: &WrappedModel<'_>, x: InputView<'_>) -> Result<Array2<f64>> {
    match (model, x) {
        (WrappedModel::Numeric(m), InputView::Numeric(x)) => m.predict(x),
        (WrappedModel::Text(m), InputView::Text(x)) => Ok(m.predict(x)?),
        (
            WrappedModel::Text(m),
            InputView::Embeddings {
                embeddings,
                attention_mask,
            },
        ) => Ok(m.predict_embeddings(embeddings, attention_mask)?),
        _ => Err(XaiError::DataContract(
            "the model and the input passed to the prediction guard have different modalities".to_string(),
        )),
    }
}

/// Overwrite the scores at `indices` with NaN
pub fn nan_where(scores: &mut [f64], indices: &[usize]) {
    for &i in indices {
        if let Some(s) = scores.get_mut(i) {
            *s = f64::NAN;
        }
    }
}

/// Reduce (rounds x instances) to one score per instance with `reduce`
pub fn reduce_rounds(rounds: &[Vec<f64>], n: usize, reduce: impl Fn(&[f64]) -> f64) -> Vec<Score> {
    (0..n)
        .map(|i| {
            let column: Vec<f64> = rounds.iter().filter_map(|r| r.get(i).copied()).collect();
            Score::Value(reduce(&column))
        })
        .collect()
}
