// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Avg-Sensitivity
//!
//! Monte-Carlo estimate of how much an explanation moves under small input perturbations:
//! the mean over `nr_samples` of `‖a - a'‖ / ‖a‖`. Rounds where the prediction flipped are
//! skipped by the mean.

use crate::config::{warn_parameterisation, MetricConfig};
use crate::error::{Result, XaiError};
use crate::functions::perturb::{typo_replacement, uniform_noise};
use crate::functions::similarity::fro;
use crate::functions::{normalise, NoiseType, NormFn, PerturbFn, TextPerturbFn};
use crate::perturbation::{nan_where, reduce_rounds, InputView, Perturbation, PerturbationGuard};
use crate::pipeline::{
    explain_numeric, explain_text, BatchedMetric, CallContext, EvalBatch, MetricCore, RawBatch, Score, WrappedModel,
};
use crate::text::{get_embeddings, stack_token_scores, TextInput, TokenAttribution};
use crate::utils::{instance, nan_mean};
use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvgSensitivityParams {
    pub nr_samples: usize,
    /// Half-width of the default uniform noise for numeric input
    pub lower_bound: f64,
    /// Letters replaced per string by the default text perturbation
    pub typos_per_text: usize,
    pub return_nan_when_prediction_changes: bool,
}

impl Default for AvgSensitivityParams {
    fn default() -> Self {
        Self {
            nr_samples: 50,
            lower_bound: 0.2,
            typos_per_text: 1,
            return_nan_when_prediction_changes: true,
        }
    }
}

pub struct AvgSensitivity {
    core: MetricCore,
    params: AvgSensitivityParams,
    perturbation: Option<Perturbation>,
    norm_numerator: NormFn,
    norm_denominator: NormFn,
}

/// `‖a - a'‖ / ‖a‖` per row
fn sensitivity(a: &Array2<f64>, a_p: &Array2<f64>, numerator: &NormFn, denominator: &NormFn) -> Result<Vec<f64>> {
    if a.shape() != a_p.shape() {
        return Err(XaiError::shape(a.shape(), a_p.shape()));
    }
    Ok(a.rows()
        .into_iter()
        .zip(a_p.rows())
        .map(|(row, row_p)| {
            let diff: ArrayD<f64> = (&row - &row_p).into_dyn();
            numerator(&diff) / denominator(&row.to_owned().into_dyn())
        })
        .collect())
}

fn padded(a: &[TokenAttribution], a_p: &[TokenAttribution]) -> (Array2<f64>, Array2<f64>) {
    let len = a.iter().chain(a_p).map(TokenAttribution::len).max().unwrap_or(0);
    (stack_token_scores(a, len), stack_token_scores(a_p, len))
}

impl AvgSensitivity {
    pub fn new(config: MetricConfig, params: AvgSensitivityParams) -> Result<Self> {
        if params.nr_samples == 0 {
            return Err(XaiError::config("nr_samples", "must be at least 1"));
        }
        if !(params.lower_bound > 0.0) {
            return Err(XaiError::config(
                "lower_bound",
                format!("must be positive, got {}", params.lower_bound),
            ));
        }
        warn_parameterisation(
            &config,
            "Avg-Sensitivity",
            "the amount of noise added 'lower_bound', the number of samples iterated over 'nr_samples' \
             and the function to perturb the input 'perturb_func'",
        );
        Ok(Self {
            core: MetricCore::new(config).with_normalise_func(normalise::sum_to_one()),
            params,
            perturbation: None,
            norm_numerator: fro(),
            norm_denominator: fro(),
        })
    }

    pub fn with_perturb_func(mut self, perturb_func: PerturbFn) -> Self {
        self.perturbation = Some(Perturbation::Numeric(perturb_func));
        self
    }

    pub fn with_text_perturb_func(mut self, perturb_func: TextPerturbFn) -> Self {
        self.perturbation = Some(Perturbation::PlainText(perturb_func));
        self
    }

    pub fn with_norms(mut self, numerator: NormFn, denominator: NormFn) -> Self {
        self.norm_numerator = numerator;
        self.norm_denominator = denominator;
        self
    }

    /// Typos for text classifiers, uniform noise for numeric ones, unless set explicitly
    fn guard(&self, model: &WrappedModel<'_>) -> PerturbationGuard {
        let perturbation = match (&self.perturbation, model) {
            (Some(p), _) => p.clone(),
            (None, WrappedModel::Text(_)) => Perturbation::PlainText(typo_replacement(self.params.typos_per_text)),
            (None, WrappedModel::Numeric(_)) => {
                Perturbation::Numeric(uniform_noise(self.params.lower_bound, None, NoiseType::Additive))
            }
        };
        PerturbationGuard::new(
            perturbation,
            self.params.nr_samples,
            self.params.return_nan_when_prediction_changes,
        )
    }

    fn numeric_round(
        &self,
        guard: &PerturbationGuard,
        model: &WrappedModel<'_>,
        batch: &EvalBatch,
        ctx: &mut CallContext,
    ) -> Result<Vec<f64>> {
        let interface = model.as_numeric()?;
        let x = batch.x.as_numeric()?;
        let a = batch.a.as_numeric()?;
        let x_p = guard.perturb_batch(x, &mut ctx.rng)?;
        let a_p = explain_numeric(&self.core, interface, ctx, &x_p, &batch.y)?;
        let mut round = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let diff = instance(a, i) - instance(&a_p, i);
            round.push((self.norm_numerator)(&diff) / (self.norm_denominator)(&instance(a, i)));
        }
        let changed = guard.changed_prediction_indices(model, InputView::Numeric(x), InputView::Numeric(&x_p))?;
        nan_where(&mut round, &changed);
        Ok(round)
    }

    fn text_round(
        &self,
        guard: &PerturbationGuard,
        model: &WrappedModel<'_>,
        batch: &EvalBatch,
        ctx: &mut CallContext,
    ) -> Result<Vec<f64>> {
        let text_model = model.as_text()?;
        let x = batch.x.as_text()?;
        let a = batch.a.as_text()?;
        if guard.perturbation.is_plain_text() {
            let x_p = guard.perturb_text(x, &mut ctx.rng)?;
            let a_p = explain_text(&self.core, text_model, ctx, TextInput::Plain(&x_p), &batch.y)?;
            let (e, e_p) = padded(a, &a_p);
            let mut round = sensitivity(&e, &e_p, &self.norm_numerator, &self.norm_denominator)?;
            let changed = guard.changed_prediction_indices(model, InputView::Text(x), InputView::Text(&x_p))?;
            nan_where(&mut round, &changed);
            Ok(round)
        } else {
            let (embeddings, encoding) = get_embeddings(text_model, x, true)?;
            let mask = &encoding.attention_mask;
            let embeddings_p = guard.perturb_embeddings(&embeddings, &mut ctx.rng)?;
            let a_p = explain_text(
                &self.core,
                text_model,
                ctx,
                TextInput::Embeddings {
                    embeddings: &embeddings_p,
                    attention_mask: mask,
                },
                &batch.y,
            )?;
            let (e, e_p) = padded(a, &a_p);
            let mut round = sensitivity(&e, &e_p, &self.norm_numerator, &self.norm_denominator)?;
            let changed = guard.changed_prediction_indices(
                model,
                InputView::Embeddings {
                    embeddings: &embeddings,
                    attention_mask: mask,
                },
                InputView::Embeddings {
                    embeddings: &embeddings_p,
                    attention_mask: mask,
                },
            )?;
            nan_where(&mut round, &changed);
            Ok(round)
        }
    }
}

impl BatchedMetric for AvgSensitivity {
    fn name(&self) -> &'static str {
        "AvgSensitivity"
    }

    fn core(&self) -> &MetricCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MetricCore {
        &mut self.core
    }

    fn custom_preprocess(&self, model: &WrappedModel<'_>, _batches: &[RawBatch], ctx: &mut CallContext) -> Result<()> {
        self.guard(model).check_model(model)?;
        if ctx.explainer.is_none() {
            return Err(XaiError::config(
                "explain_func",
                "Avg-Sensitivity re-explains perturbed inputs and needs an explain function",
            ));
        }
        Ok(())
    }

    fn evaluate_batch(&self, model: &WrappedModel<'_>, batch: &EvalBatch, ctx: &mut CallContext) -> Result<Vec<Score>> {
        let guard = self.guard(model);
        let mut rounds = Vec::with_capacity(guard.nr_samples);
        for _ in 0..guard.nr_samples {
            let round = if model.is_text() {
                self.text_round(&guard, model, batch, ctx)?
            } else {
                self.numeric_round(&guard, model, batch, ctx)?
            };
            rounds.push(round);
        }
        Ok(reduce_rounds(&rounds, batch.len(), nan_mean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_images, synthetic_sentences, synthetic_vocabulary};
    use crate::functions::perturb::word_dropout;
    use crate::pipeline::{EvalInput, ModelRef};
    use crate::reference::{occlusion_explainer, saliency_explainer, BagOfEmbeddingsClassifier, DenseClassifier};
    use ndarray::array;

    #[test]
    fn test_sensitivity_rows() {
        let a = array![[1.0, 0.0], [0.0, 2.0]];
        let a_p = array![[1.0, 0.0], [0.0, 0.0]];
        let s = sensitivity(&a, &a_p, &fro(), &fro()).unwrap();
        assert_eq!(s, vec![0.0, 1.0]);
    }

    #[test]
    fn test_linear_model_is_insensitive() {
        let model = DenseClassifier::new(&[16, 2], 2);
        let mut metric = AvgSensitivity::new(
            MetricConfig::default().quiet(),
            AvgSensitivityParams {
                nr_samples: 3,
                return_nan_when_prediction_changes: false,
                ..AvgSensitivityParams::default()
            },
        )
        .unwrap();
        let out = metric
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(synthetic_images(3, 1, 4, 4, 1)).with_explain_func(saliency_explainer(1e-3)),
            )
            .unwrap();
        for v in out.values().unwrap() {
            assert!(v < 1e-6);
        }
    }

    #[test]
    fn test_text_defaults_to_typos() {
        let model = BagOfEmbeddingsClassifier::new(&synthetic_vocabulary(), 6, 2, 3);
        let mut metric = AvgSensitivity::new(
            MetricConfig::default().quiet(),
            AvgSensitivityParams {
                nr_samples: 2,
                ..AvgSensitivityParams::default()
            },
        )
        .unwrap();
        let x = synthetic_sentences(4, 6, 5);
        let out = metric
            .call(ModelRef::text(&model), EvalInput::new(x.clone()).with_explain_func(occlusion_explainer()))
            .unwrap();
        assert_eq!(out.len(), 4);

        let mut dropout = AvgSensitivity::new(
            MetricConfig::default().quiet(),
            AvgSensitivityParams {
                nr_samples: 2,
                ..AvgSensitivityParams::default()
            },
        )
        .unwrap()
        .with_text_perturb_func(word_dropout(2));
        let out = dropout
            .call(ModelRef::text(&model), EvalInput::new(x).with_explain_func(occlusion_explainer()))
            .unwrap();
        assert_eq!(out.len(), 4);
    }
}
