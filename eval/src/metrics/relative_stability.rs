// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Relative Input, Output and Representation Stability
//!
//! For each perturbation round the relative change of the explanation,
//! `‖(e_x - e_x') / (e_x + ε)‖₂`, is divided by the relative change of a reference quantity
//! plus ε:
//! - input stability: the input itself
//! - output stability: the model's logits
//! - representation stability: hidden-layer activations
//!
//! Scores are the maximum over rounds; rounds whose perturbation flipped the prediction
//! are NaN and make the maximum NaN.
//!
//! Text classifiers are supported with a plain-text perturbation (typos, word dropout) or a
//! numeric perturbation applied to the token embeddings.

use crate::config::{warn_parameterisation, MetricConfig};
use crate::error::{Result, XaiError};
use crate::functions::normalise::{self, NormaliseFn};
use crate::functions::perturb::uniform_noise;
use crate::functions::{NoiseType, PerturbFn, TextPerturbFn};
use crate::metrics::flatten_rows;
use crate::model::LayerSelection;
use crate::perturbation::{nan_where, reduce_rounds, InputView, Perturbation, PerturbationGuard};
use crate::pipeline::{
    explain_numeric, explain_text, BatchedMetric, CallContext, EvalBatch, MetricCore, RawBatch, Score, WrappedModel,
};
use crate::text::{get_embeddings, stack_token_scores, TextClassifier, TextInput, TokenAttribution};
use crate::utils::propagating_max;
use ndarray::{Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};

/// What the explanation change is measured against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityKind {
    Input,
    Output,
    Representation(LayerSelection),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeStabilityParams {
    pub nr_samples: usize,
    /// Bounds of the default additive uniform noise
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub return_nan_when_prediction_changes: bool,
}

impl Default for RelativeStabilityParams {
    fn default() -> Self {
        Self {
            nr_samples: 200,
            lower_bound: 0.02,
            upper_bound: 0.2,
            return_nan_when_prediction_changes: true,
        }
    }
}

/// Guards divisions in the stability objective
pub const EPS_MIN: f64 = f32::EPSILON as f64;

pub struct RelativeStability {
    core: MetricCore,
    kind: StabilityKind,
    guard: PerturbationGuard,
}

/// `‖(before - after) / (before + ε)‖₂` of one flattened instance
fn relative_change(before: ArrayView1<f64>, after: ArrayView1<f64>) -> f64 {
    before
        .iter()
        .zip(after.iter())
        .map(|(b, a)| {
            let r = (b - a) / (b + EPS_MIN);
            r * r
        })
        .sum::<f64>()
        .sqrt()
}

/// Per-instance stability objective over (batch, features) arrays
fn objective(e: &Array2<f64>, e_p: &Array2<f64>, r: &Array2<f64>, r_p: &Array2<f64>) -> Result<Vec<f64>> {
    if e.shape() != e_p.shape() {
        return Err(XaiError::shape(e.shape(), e_p.shape()));
    }
    if r.shape() != r_p.shape() {
        return Err(XaiError::shape(r.shape(), r_p.shape()));
    }
    Ok(e.rows()
        .into_iter()
        .zip(e_p.rows())
        .zip(r.rows().into_iter().zip(r_p.rows()))
        .map(|((e, e_p), (r, r_p))| relative_change(e, e_p) / (relative_change(r, r_p) + EPS_MIN))
        .collect())
}

/// Token scores of two explanation batches padded to a common length
fn padded_scores(a: &[TokenAttribution], a_p: &[TokenAttribution]) -> (Array2<f64>, Array2<f64>) {
    let len = a.iter().chain(a_p).map(TokenAttribution::len).max().unwrap_or(0);
    (stack_token_scores(a, len), stack_token_scores(a_p, len))
}

fn embeddings_rows(e: &Array3<f64>) -> Result<Array2<f64>> {
    flatten_rows(&e.clone().into_dyn())
}

impl RelativeStability {
    fn build(config: MetricConfig, params: RelativeStabilityParams, kind: StabilityKind, label: &str) -> Result<Self> {
        if params.nr_samples == 0 {
            return Err(XaiError::config("nr_samples", "must be at least 1"));
        }
        if !(params.lower_bound < params.upper_bound) {
            return Err(XaiError::config(
                "upper_bound",
                format!(
                    "must exceed lower_bound ({} >= {})",
                    params.lower_bound, params.upper_bound
                ),
            ));
        }
        warn_parameterisation(
            &config,
            label,
            "the function to perturb the input 'perturb_func', the number of samples 'nr_samples' \
             and the noise bounds 'lower_bound' and 'upper_bound'",
        );
        let perturb = uniform_noise(params.lower_bound, Some(params.upper_bound), NoiseType::Additive);
        Ok(Self {
            core: MetricCore::new(config).with_normalise_func(normalise::by_second_moment()),
            kind,
            guard: PerturbationGuard::new(
                Perturbation::Numeric(perturb),
                params.nr_samples,
                params.return_nan_when_prediction_changes,
            ),
        })
    }

    /// Relative Input Stability
    pub fn input(config: MetricConfig, params: RelativeStabilityParams) -> Result<Self> {
        Self::build(config, params, StabilityKind::Input, "Relative Input Stability")
    }

    /// Relative Output Stability
    pub fn output(config: MetricConfig, params: RelativeStabilityParams) -> Result<Self> {
        Self::build(config, params, StabilityKind::Output, "Relative Output Stability")
    }

    /// Relative Representation Stability over the selected hidden layers
    pub fn representation(
        config: MetricConfig,
        params: RelativeStabilityParams,
        layers: LayerSelection,
    ) -> Result<Self> {
        Self::build(
            config,
            params,
            StabilityKind::Representation(layers),
            "Relative Representation Stability",
        )
    }

    /// Configuration without normalisation; enable it to scale by the second moment
    pub fn default_config() -> MetricConfig {
        MetricConfig::default().with_normalise(false)
    }

    pub fn kind(&self) -> &StabilityKind {
        &self.kind
    }

    pub fn with_normalise_func(mut self, normalise_func: NormaliseFn) -> Self {
        self.core.normalise_func = normalise_func;
        self
    }

    pub fn with_perturb_func(mut self, perturb_func: PerturbFn) -> Self {
        self.guard.perturbation = Perturbation::Numeric(perturb_func);
        self
    }

    /// Perturb text as strings instead of in embedding space
    pub fn with_text_perturb_func(mut self, perturb_func: TextPerturbFn) -> Self {
        self.guard.perturbation = Perturbation::PlainText(perturb_func);
        self
    }

    fn evaluate_numeric(&self, model: &WrappedModel<'_>, batch: &EvalBatch, ctx: &mut CallContext) -> Result<Vec<Score>> {
        let interface = model.as_numeric()?;
        let x = batch.x.as_numeric()?;
        let e = flatten_rows(batch.a.as_numeric()?)?;
        let n = batch.len();
        let reference = match &self.kind {
            StabilityKind::Input => flatten_rows(x)?,
            StabilityKind::Output => interface.predict(x)?,
            StabilityKind::Representation(layers) => interface.hidden_representations(x, layers)?,
        };

        let mut rounds = Vec::with_capacity(self.guard.nr_samples);
        for _ in 0..self.guard.nr_samples {
            let x_p = self.guard.perturb_batch(x, &mut ctx.rng)?;
            let e_p = flatten_rows(&explain_numeric(&self.core, interface, ctx, &x_p, &batch.y)?)?;
            let reference_p = match &self.kind {
                StabilityKind::Input => flatten_rows(&x_p)?,
                StabilityKind::Output => interface.predict(&x_p)?,
                StabilityKind::Representation(layers) => interface.hidden_representations(&x_p, layers)?,
            };
            let mut round = objective(&e, &e_p, &reference, &reference_p)?;
            let changed =
                self.guard
                    .changed_prediction_indices(model, InputView::Numeric(x), InputView::Numeric(&x_p))?;
            nan_where(&mut round, &changed);
            rounds.push(round);
        }
        Ok(reduce_rounds(&rounds, n, |column| propagating_max(column.iter().copied())))
    }

    fn plain_text_round(
        &self,
        model: &WrappedModel<'_>,
        text_model: &dyn TextClassifier,
        batch: &EvalBatch,
        ctx: &mut CallContext,
    ) -> Result<Vec<f64>> {
        let x = batch.x.as_text()?;
        let a = batch.a.as_text()?;
        let x_p = self.guard.perturb_text(x, &mut ctx.rng)?;
        let a_p = explain_text(&self.core, text_model, ctx, TextInput::Plain(&x_p), &batch.y)?;
        let (e, e_p) = padded_scores(a, &a_p);

        let (reference, reference_p) = match &self.kind {
            StabilityKind::Input => {
                // One joint encoding pads originals and perturbations to the same length.
                let mut joint = x.to_vec();
                joint.extend(x_p.iter().cloned());
                let (embeddings, _) = get_embeddings(text_model, &joint, true)?;
                let all = embeddings_rows(&embeddings)?;
                let (before, after) = all.view().split_at(ndarray::Axis(0), x.len());
                (before.to_owned(), after.to_owned())
            }
            StabilityKind::Output => (text_model.predict(x)?, text_model.predict(&x_p)?),
            StabilityKind::Representation(layers) => (
                text_model.hidden_representations(x, layers)?,
                text_model.hidden_representations(&x_p, layers)?,
            ),
        };
        let mut round = objective(&e, &e_p, &reference, &reference_p)?;
        let changed = self
            .guard
            .changed_prediction_indices(model, InputView::Text(x), InputView::Text(&x_p))?;
        nan_where(&mut round, &changed);
        Ok(round)
    }

    fn embedding_round(
        &self,
        model: &WrappedModel<'_>,
        text_model: &dyn TextClassifier,
        batch: &EvalBatch,
        ctx: &mut CallContext,
    ) -> Result<Vec<f64>> {
        let x = batch.x.as_text()?;
        let a = batch.a.as_text()?;
        let (embeddings, encoding) = get_embeddings(text_model, x, true)?;
        let mask = &encoding.attention_mask;
        let embeddings_p = self.guard.perturb_embeddings(&embeddings, &mut ctx.rng)?;
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
        let (e, e_p) = padded_scores(a, &a_p);

        let (reference, reference_p) = match &self.kind {
            StabilityKind::Input => (embeddings_rows(&embeddings)?, embeddings_rows(&embeddings_p)?),
            StabilityKind::Output => (
                text_model.predict_embeddings(&embeddings, mask)?,
                text_model.predict_embeddings(&embeddings_p, mask)?,
            ),
            StabilityKind::Representation(layers) => (
                text_model.hidden_representations_embeddings(&embeddings, mask, layers)?,
                text_model.hidden_representations_embeddings(&embeddings_p, mask, layers)?,
            ),
        };
        let mut round = objective(&e, &e_p, &reference, &reference_p)?;
        let changed = self.guard.changed_prediction_indices(
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

impl BatchedMetric for RelativeStability {
    fn name(&self) -> &'static str {
        match self.kind {
            StabilityKind::Input => "RelativeInputStability",
            StabilityKind::Output => "RelativeOutputStability",
            StabilityKind::Representation(_) => "RelativeRepresentationStability",
        }
    }

    fn core(&self) -> &MetricCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MetricCore {
        &mut self.core
    }

    fn custom_preprocess(&self, model: &WrappedModel<'_>, _batches: &[RawBatch], ctx: &mut CallContext) -> Result<()> {
        self.guard.check_model(model)?;
        if ctx.explainer.is_none() {
            return Err(XaiError::config(
                "explain_func",
                "relative stability re-explains perturbed inputs and needs an explain function",
            ));
        }
        Ok(())
    }

    fn evaluate_batch(&self, model: &WrappedModel<'_>, batch: &EvalBatch, ctx: &mut CallContext) -> Result<Vec<Score>> {
        let text_model = match model {
            WrappedModel::Numeric(_) => return self.evaluate_numeric(model, batch, ctx),
            WrappedModel::Text(m) => *m,
        };
        let mut rounds = Vec::with_capacity(self.guard.nr_samples);
        for _ in 0..self.guard.nr_samples {
            let round = if self.guard.perturbation.is_plain_text() {
                self.plain_text_round(model, text_model, batch, ctx)?
            } else {
                self.embedding_round(model, text_model, batch, ctx)?
            };
            rounds.push(round);
        }
        Ok(reduce_rounds(&rounds, batch.len(), |column| propagating_max(column.iter().copied())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_images, synthetic_sentences, synthetic_vocabulary};
    use crate::functions::perturb::{baseline_replacement_by_indices, word_dropout};
    use crate::functions::Baseline;
    use crate::model::Classifier;
    use crate::pipeline::{EvalInput, ModelRef};
    use crate::reference::{occlusion_explainer, saliency_explainer, BagOfEmbeddingsClassifier, DenseClassifier};
    use ndarray::array;

    fn params(nr_samples: usize, guard: bool) -> RelativeStabilityParams {
        RelativeStabilityParams {
            nr_samples,
            return_nan_when_prediction_changes: guard,
            ..RelativeStabilityParams::default()
        }
    }

    #[test]
    fn test_objective_identical_explanations_score_zero() {
        let e = array![[1.0, 2.0], [3.0, 4.0]];
        let x = array![[1.0, 1.0], [1.0, 1.0]];
        let x_p = array![[1.1, 1.0], [1.0, 0.9]];
        let scores = objective(&e, &e, &x, &x_p).unwrap();
        assert_eq!(scores, vec![0.0, 0.0]);
        let e_p = array![[2.0, 2.0], [3.0, 4.0]];
        let scores = objective(&e, &e_p, &x, &x_p).unwrap();
        assert!(scores[0] > 1.0);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn test_default_config_skips_normalisation() {
        let metric = RelativeStability::input(RelativeStability::default_config(), params(1, false)).unwrap();
        assert!(!metric.core().config.normalise);
        let a = array![[2.0, -4.0, 1.0]].into_dyn();
        let scaled = (metric.core().normalise_func)(&a).unwrap();
        let rms = 7.0_f64.sqrt();
        for (got, want) in scaled.iter().zip([2.0 / rms, -4.0 / rms, 1.0 / rms]) {
            approx::assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
        approx::assert_abs_diff_eq!(scaled[[0, 0]], 0.756, epsilon = 1e-3);
    }

    #[test]
    fn test_one_score_per_instance_for_every_kind() {
        let model = DenseClassifier::new(&[16, 8, 3], 4);
        let x = synthetic_images(5, 1, 4, 4, 9);
        let metrics = vec![
            RelativeStability::input(MetricConfig::default().quiet(), params(2, false)).unwrap(),
            RelativeStability::output(MetricConfig::default().quiet(), params(2, false)).unwrap(),
            RelativeStability::representation(MetricConfig::default().quiet(), params(2, false), LayerSelection::indices(vec![0]))
                .unwrap(),
        ];
        for mut metric in metrics {
            let out = metric
                .call(
                    ModelRef::numeric(&model),
                    EvalInput::new(x.clone())
                        .with_explain_func(saliency_explainer(1e-3))
                        .with_batch_size(2),
                )
                .unwrap();
            assert_eq!(out.len(), 5, "{}", metric.name());
        }
    }

    #[test]
    fn test_flipped_predictions_are_nan() {
        let model = DenseClassifier::new(&[4, 2], 0);
        let x = ndarray::Array::from_shape_vec(ndarray::IxDyn(&[2, 4]), vec![3.0, -2.0, 1.0, 0.5, -1.0, 2.0, -3.0, 0.2])
            .unwrap();
        let logits = crate::model::ModelInterface::new(&model, true, false, None, crate::config::Kwargs::new())
            .predict(&x)
            .unwrap();
        // Replacing everything by a constant gives every instance the same prediction.
        let mut metric = RelativeStability::input(MetricConfig::default().quiet(), params(3, true))
            .unwrap()
            .with_perturb_func(baseline_replacement_by_indices(Baseline::Value(0.0)));
        let out = metric
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(x.clone()).with_explain_func(saliency_explainer(1e-3)),
            )
            .unwrap();
        let zero = ndarray::Array::zeros(ndarray::IxDyn(&[1, 4]));
        let zero_label = crate::utils::argmax_rows(&model.forward(&zero, &crate::config::Kwargs::new()).unwrap())[0];
        for (i, score) in out.scores().unwrap().iter().enumerate() {
            let label = crate::utils::argmax(logits.row(i));
            assert_eq!(score.is_nan(), label != zero_label);
        }
    }

    #[test]
    fn test_text_plain_and_embedding_paths() {
        let model = BagOfEmbeddingsClassifier::new(&synthetic_vocabulary(), 8, 2, 1);
        let x = synthetic_sentences(3, 5, 2);

        let mut plain = RelativeStability::input(MetricConfig::default().quiet(), params(2, false))
            .unwrap()
            .with_text_perturb_func(word_dropout(1));
        let out = plain
            .call(
                ModelRef::text(&model),
                EvalInput::new(x.clone()).with_explain_func(occlusion_explainer()),
            )
            .unwrap();
        assert_eq!(out.len(), 3);

        let mut embedded = RelativeStability::output(MetricConfig::default().quiet(), params(2, true)).unwrap();
        let out = embedded
            .call(ModelRef::text(&model), EvalInput::new(x).with_explain_func(occlusion_explainer()))
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_plain_text_perturbation_needs_text_model() {
        let model = DenseClassifier::new(&[16, 2], 0);
        let mut metric = RelativeStability::input(MetricConfig::default().quiet(), params(1, false))
            .unwrap()
            .with_text_perturb_func(word_dropout(1));
        let result = metric.call(
            ModelRef::numeric(&model),
            EvalInput::new(synthetic_images(2, 1, 4, 4, 0)).with_explain_func(saliency_explainer(1e-3)),
        );
        assert!(result.is_err());
    }
}
