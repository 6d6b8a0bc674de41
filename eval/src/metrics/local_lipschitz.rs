// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Local Lipschitz Estimate
//!
//! Largest ratio of explanation change to input change over `nr_samples` Gaussian
//! perturbations of each instance. Lower is more robust.

use crate::config::{warn_parameterisation, MetricConfig};
use crate::error::{Result, XaiError};
use crate::functions::perturb::gaussian_noise;
use crate::functions::{normalise, similarity, NoiseType, PerturbFn, SimilarityFn};
use crate::perturbation::{nan_where, reduce_rounds, InputView, Perturbation, PerturbationGuard};
use crate::pipeline::{explain_numeric, BatchedMetric, CallContext, EvalBatch, MetricCore, RawBatch, Score, WrappedModel};
use crate::utils::{instance, propagating_max};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalLipschitzParams {
    pub nr_samples: usize,
    pub perturb_mean: f64,
    pub perturb_std: f64,
    pub return_nan_when_prediction_changes: bool,
}

impl Default for LocalLipschitzParams {
    fn default() -> Self {
        Self {
            nr_samples: 200,
            perturb_mean: 0.0,
            perturb_std: 0.1,
            return_nan_when_prediction_changes: true,
        }
    }
}

pub struct LocalLipschitzEstimate {
    core: MetricCore,
    guard: PerturbationGuard,
    similarity_func: SimilarityFn,
}

impl LocalLipschitzEstimate {
    pub fn new(config: MetricConfig, params: LocalLipschitzParams) -> Result<Self> {
        if params.nr_samples == 0 {
            return Err(XaiError::config("nr_samples", "must be at least 1"));
        }
        if !(params.perturb_std >= 0.0) {
            return Err(XaiError::config(
                "perturb_std",
                format!("must be non-negative, got {}", params.perturb_std),
            ));
        }
        warn_parameterisation(
            &config,
            "Local Lipschitz Estimate",
            "the amount of noise added 'perturb_std', the number of samples iterated over 'nr_samples', \
             the function to perturb the input 'perturb_func' and the similarity metric 'similarity_func'",
        );
        if params.perturb_std == 0.0 && !config.disable_warnings {
            tracing::warn!("perturb_std is zero; perturbed inputs will equal the originals");
        }
        let perturb = gaussian_noise(params.perturb_mean, params.perturb_std, NoiseType::Additive);
        Ok(Self {
            core: MetricCore::new(config).with_normalise_func(normalise::by_negative()),
            guard: PerturbationGuard::new(
                Perturbation::Numeric(perturb),
                params.nr_samples,
                params.return_nan_when_prediction_changes,
            ),
            similarity_func: similarity::lipschitz(),
        })
    }

    pub fn with_perturb_func(mut self, perturb_func: PerturbFn) -> Self {
        self.guard.perturbation = Perturbation::Numeric(perturb_func);
        self
    }

    pub fn with_similarity_func(mut self, similarity_func: SimilarityFn) -> Self {
        self.similarity_func = similarity_func;
        self
    }

    pub fn with_normalise_func(mut self, normalise_func: crate::functions::NormaliseFn) -> Self {
        self.core.normalise_func = normalise_func;
        self
    }
}

impl BatchedMetric for LocalLipschitzEstimate {
    fn name(&self) -> &'static str {
        "LocalLipschitzEstimate"
    }

    fn core(&self) -> &MetricCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MetricCore {
        &mut self.core
    }

    fn custom_preprocess(&self, model: &WrappedModel<'_>, _batches: &[RawBatch], ctx: &mut CallContext) -> Result<()> {
        model.as_numeric()?;
        if ctx.explainer.is_none() {
            return Err(XaiError::config(
                "explain_func",
                "Local Lipschitz Estimate re-explains perturbed inputs and needs an explain function",
            ));
        }
        Ok(())
    }

    fn evaluate_batch(&self, model: &WrappedModel<'_>, batch: &EvalBatch, ctx: &mut CallContext) -> Result<Vec<Score>> {
        let interface = model.as_numeric()?;
        let x = batch.x.as_numeric()?;
        let a = batch.a.as_numeric()?;
        let n = batch.len();

        let mut rounds = Vec::with_capacity(self.guard.nr_samples);
        for _ in 0..self.guard.nr_samples {
            let x_perturbed = self.guard.perturb_batch(x, &mut ctx.rng)?;
            let a_perturbed = explain_numeric(&self.core, interface, ctx, &x_perturbed, &batch.y)?;
            let mut round = Vec::with_capacity(n);
            for i in 0..n {
                round.push((self.similarity_func)(
                    &instance(a, i),
                    &instance(&a_perturbed, i),
                    &instance(x, i),
                    &instance(&x_perturbed, i),
                )?);
            }
            let changed = self.guard.changed_prediction_indices(
                model,
                InputView::Numeric(x),
                InputView::Numeric(&x_perturbed),
            )?;
            nan_where(&mut round, &changed);
            rounds.push(round);
        }
        Ok(reduce_rounds(&rounds, n, |column| propagating_max(column.iter().copied())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_images;
    use crate::pipeline::{EvalInput, ModelRef};
    use crate::reference::{occlusion_explainer, saliency_explainer, BagOfEmbeddingsClassifier, DenseClassifier};

    fn params(nr_samples: usize) -> LocalLipschitzParams {
        LocalLipschitzParams {
            nr_samples,
            ..LocalLipschitzParams::default()
        }
    }

    #[test]
    fn test_lle_linear_model_is_finite() {
        let model = DenseClassifier::new(&[16, 2], 0);
        let mut metric = LocalLipschitzEstimate::new(
            MetricConfig::default().quiet(),
            LocalLipschitzParams {
                return_nan_when_prediction_changes: false,
                ..params(3)
            },
        )
        .unwrap();
        let out = metric
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(synthetic_images(3, 1, 4, 4, 0))
                    .with_explain_func(saliency_explainer(1e-3))
                    .with_batch_size(2),
            )
            .unwrap();
        let values = out.values().unwrap();
        assert_eq!(values.len(), 3);
        // Saliency of a linear model does not depend on the input.
        for v in values {
            assert!(v.is_finite() && v >= 0.0 && v < 1e-3);
        }
    }

    #[test]
    fn test_lle_needs_explain_func() {
        let model = DenseClassifier::new(&[16, 2], 0);
        let mut metric = LocalLipschitzEstimate::new(MetricConfig::default().quiet(), params(2)).unwrap();
        let a = crate::data::synthetic_attributions(&[2, 1, 4, 4], 0);
        let err = metric
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(synthetic_images(2, 1, 4, 4, 0)).with_attributions(a),
            )
            .unwrap_err();
        assert!(err.to_string().contains("explain_func"));
    }

    #[test]
    fn test_lle_rejects_text_models() {
        let model = BagOfEmbeddingsClassifier::new(&crate::data::synthetic_vocabulary(), 4, 2, 0);
        let mut metric = LocalLipschitzEstimate::new(MetricConfig::default().quiet(), params(2)).unwrap();
        let err = metric
            .call(
                ModelRef::text(&model),
                EvalInput::new(vec!["good film".to_string()]).with_explain_func(occlusion_explainer()),
            )
            .unwrap_err();
        assert!(matches!(err, XaiError::Unsupported(_)));
    }

    #[test]
    fn test_lle_rejects_zero_samples() {
        assert!(LocalLipschitzEstimate::new(MetricConfig::default(), params(0)).is_err());
    }
}
