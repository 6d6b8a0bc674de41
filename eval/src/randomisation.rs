// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model parameter randomisation
//!
//! Layers of a classifier are re-initialised one after another and the explanations of
//! every corrupted state are graded with an intrinsic quality function. An explanation
//! method that keeps producing equally good explanations for a destroyed model does not
//! depend on what the model learned.
//!
//! [`LayerRandomisation`] owns the mutable borrow of the caller's model for the duration
//! of the walk. The original parameters are snapshotted on creation and written back on
//! [`LayerRandomisation::restore`] or, failing that, on drop.

use crate::config::{warn_parameterisation, LayerOrder, MetricConfig};
use crate::error::{Result, XaiError};
use crate::explain::Explainer;
use crate::functions::{quality, QualityFn};
use crate::model::{Classifier, StateDict};
use crate::pipeline::{canonicalise, progress_bar, CallContext, EvalInput, MetricCore, MetricOutput, ModelRef, Score};
use crate::utils::{batch_array, batch_slice, instance, stack_instances};
use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Key of the unrandomised model in the per-layer scores
pub const ORIGINAL_KEY: &str = "orig";

/// Walks the randomisable layers of a model in a fixed order
///
/// Each [`advance`](Self::advance) randomises the next layer. In cumulative orders the
/// earlier layers stay randomised; in [`LayerOrder::Independent`] the original
/// parameters are reloaded first, so exactly one layer differs from the original.
pub struct LayerRandomisation<'m> {
    model: &'m mut dyn Classifier,
    original: StateDict,
    /// `(definition index, name)` in walk order
    layers: Vec<(usize, String)>,
    order: LayerOrder,
    seed: u64,
    position: usize,
    restored: bool,
}

impl<'m> LayerRandomisation<'m> {
    pub fn new(model: &'m mut dyn Classifier, order: LayerOrder, seed: u64) -> Self {
        let original = model.state_dict();
        let mut layers: Vec<(usize, String)> = model.randomisable_layers().into_iter().enumerate().collect();
        if order == LayerOrder::TopDown {
            layers.reverse();
        }
        Self {
            model,
            original,
            layers,
            order,
            seed,
            position: 0,
            restored: false,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Number of layers randomised so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Layer names in walk order
    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(_, name)| name.as_str())
    }

    pub fn original(&self) -> &StateDict {
        &self.original
    }

    /// Randomise the next layer and return its name, or `None` when the walk is over
    pub fn advance(&mut self) -> Result<Option<String>> {
        let Some((index, name)) = self.layers.get(self.position).cloned() else {
            return Ok(None);
        };
        if !self.order.is_cumulative() {
            self.model.load_state_dict(&self.original)?;
        }
        // Seeded by definition index so a layer gets the same weights in every order.
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(index as u64 + 1));
        self.model.randomise_layer(&name, &mut rng)?;
        self.position += 1;
        self.restored = false;
        tracing::debug!(layer = %name, order = %self.order, step = self.position, "Layer randomised");
        Ok(Some(name))
    }

    /// The model in its current state
    pub fn model(&self) -> &dyn Classifier {
        &*self.model
    }

    fn restore_in_place(&mut self) -> Result<()> {
        if !self.restored {
            self.model.load_state_dict(&self.original)?;
            self.restored = true;
        }
        Ok(())
    }

    /// Write the original parameters back, ending the walk
    pub fn restore(mut self) -> Result<()> {
        self.restore_in_place()
    }
}

impl Drop for LayerRandomisation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore_in_place() {
            tracing::error!(error = %e, "Failed to restore the original model parameters");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomisationParams {
    pub layer_order: LayerOrder,
    /// Size of the uniformly random explanation baseline
    pub nr_samples: usize,
    /// Average the quality over all states per instance
    pub return_sample_quality: bool,
    /// Ratio of the last randomised state's quality to the original's
    pub return_sensitivity_score: bool,
}

impl Default for RandomisationParams {
    fn default() -> Self {
        Self {
            layer_order: LayerOrder::BottomUp,
            nr_samples: 10,
            return_sample_quality: false,
            return_sensitivity_score: false,
        }
    }
}

/// Result of one randomisation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomisationOutput {
    /// Quality of `nr_samples` uniformly random explanations
    pub scores_expl_random: Vec<f64>,
    /// Per-instance quality for [`ORIGINAL_KEY`] and each randomised layer, in walk order
    pub scores_expl_model_randomised: Vec<(String, Vec<f64>)>,
    /// Per-sample quality, sensitivity ratios or their aggregate, when requested
    pub evaluation: Option<MetricOutput>,
}

impl RandomisationOutput {
    pub fn layer(&self, name: &str) -> Option<&[f64]> {
        self.scores_expl_model_randomised
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, scores)| scores.as_slice())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.scores_expl_model_randomised.iter().map(|(k, _)| k.as_str()).collect()
    }
}

pub struct ModelParameterRandomisation {
    core: MetricCore,
    params: RandomisationParams,
    quality_func: QualityFn,
    history: Vec<RandomisationOutput>,
}

impl ModelParameterRandomisation {
    pub fn new(config: MetricConfig, params: RandomisationParams) -> Result<Self> {
        if params.nr_samples == 0 {
            return Err(XaiError::config("nr_samples", "must be at least 1"));
        }
        if params.return_sample_quality && params.return_sensitivity_score {
            return Err(XaiError::config(
                "return_sensitivity_score",
                "cannot be combined with 'return_sample_quality'",
            ));
        }
        if config.return_aggregate && !params.return_sample_quality {
            return Err(XaiError::config(
                "return_aggregate",
                "set 'return_sample_quality' to compute the aggregate",
            ));
        }
        warn_parameterisation(
            &config,
            "Model Parameter Randomisation",
            "the quality function 'quality_func', the order of the layer randomisation 'layer_order' \
             and the number of random explanations 'nr_samples'",
        );
        Ok(Self {
            core: MetricCore::new(config),
            params,
            quality_func: quality::gini(),
            history: Vec::new(),
        })
    }

    /// Configuration with magnitudes taken after normalisation
    pub fn default_config() -> MetricConfig {
        MetricConfig::default().with_abs(true)
    }

    pub fn with_quality_func(mut self, quality_func: QualityFn) -> Self {
        self.quality_func = quality_func;
        self
    }

    pub fn with_normalise_func(mut self, normalise_func: crate::functions::NormaliseFn) -> Self {
        self.core.normalise_func = normalise_func;
        self
    }

    pub fn with_aggregate_func(mut self, aggregate_func: crate::functions::AggregateFn) -> Self {
        self.core.aggregate_func = aggregate_func;
        self
    }

    pub fn params(&self) -> &RandomisationParams {
        &self.params
    }

    pub fn config(&self) -> &MetricConfig {
        &self.core.config
    }

    pub fn all_results(&self) -> &[RandomisationOutput] {
        &self.history
    }

    /// Explain `x` in mini-batches with the model in its current state
    fn explain(
        &self,
        model: &dyn Classifier,
        ctx: &CallContext,
        x: &ArrayD<f64>,
        y: &[usize],
    ) -> Result<ArrayD<f64>> {
        let Some(Explainer::Numeric(f)) = &ctx.explainer else {
            return Err(XaiError::config(
                "explain_func",
                "model randomisation re-explains every state and needs a numeric explain function",
            ));
        };
        let mut parts = Vec::new();
        for (xb, yb) in batch_array(x, ctx.batch_size)
            .iter()
            .zip(batch_slice(y, ctx.batch_size))
        {
            let a = f(model, xb, &yb, &ctx.explain_func_kwargs)?;
            parts.extend(self.core.postprocess_attributions(a)?.outer_iter().map(|v| v.to_owned()));
        }
        stack_instances(&parts)
    }

    fn grade(&self, a: &ArrayD<f64>, x: &ArrayD<f64>) -> Result<Vec<f64>> {
        (0..x.shape()[0])
            .map(|i| Ok((self.quality_func)(&instance(a, i), &instance(x, i))?))
            .collect()
    }

    /// Run the experiment on `model`, which is restored before this returns
    pub fn call(&mut self, model: &mut dyn Classifier, input: EvalInput) -> Result<RandomisationOutput> {
        let (x, y, mut ctx) = {
            let (canonical, ctx) = canonicalise(&self.core.config, ModelRef::numeric(&*model), input)?;
            let y = match canonical.y {
                Some(y) => y,
                None => canonical.model.predict_labels(&canonical.x)?,
            };
            (canonical.x.as_numeric()?.clone(), y, ctx)
        };
        if ctx.explainer.is_none() {
            return Err(XaiError::config(
                "explain_func",
                "model randomisation re-explains every state and needs an explain function",
            ));
        }
        if model.randomisable_layers().is_empty() {
            return Err(XaiError::config(
                "model",
                "model randomisation needs a model with at least one randomisable layer",
            ));
        }
        tracing::info!(
            metric = "ModelParameterRandomisation",
            instances = y.len(),
            order = %self.params.layer_order,
            "Evaluating metric"
        );

        let mut scores: Vec<(String, Vec<f64>)> = Vec::new();
        let a_original = self.explain(&*model, &ctx, &x, &y)?;
        scores.push((ORIGINAL_KEY.to_string(), self.grade(&a_original, &x)?));

        let mut random_shape = vec![self.params.nr_samples];
        random_shape.extend_from_slice(&a_original.shape()[1..]);
        let rng = &mut ctx.rng;
        let a_random = ArrayD::from_shape_simple_fn(IxDyn(&random_shape), || rng.gen::<f64>());
        let x_first = instance(&x, 0);
        let scores_expl_random = (0..self.params.nr_samples)
            .map(|i| Ok((self.quality_func)(&instance(&a_random, i), &x_first)?))
            .collect::<Result<Vec<f64>>>()?;

        let mut walk = LayerRandomisation::new(model, self.params.layer_order, self.core.config.seed);
        let pb = progress_bar(walk.len() as u64, self.core.config.display_progressbar, "layers");
        let total = walk.len();
        while let Some(layer) = walk.advance()? {
            pb.inc(1);
            if self.params.return_sensitivity_score && walk.position() < total {
                continue;
            }
            let a = self.explain(walk.model(), &ctx, &x, &y)?;
            scores.push((layer, self.grade(&a, &x)?));
        }
        pb.finish_and_clear();
        walk.restore()?;

        let evaluation = self.postprocess(&scores)?;
        let output = RandomisationOutput {
            scores_expl_random,
            scores_expl_model_randomised: scores,
            evaluation,
        };
        tracing::info!(metric = "ModelParameterRandomisation", "Metric evaluation complete");
        self.history.push(output.clone());
        Ok(output)
    }

    fn postprocess(&self, scores: &[(String, Vec<f64>)]) -> Result<Option<MetricOutput>> {
        let values = if self.params.return_sample_quality {
            let n = scores.first().map_or(0, |(_, s)| s.len());
            (0..n)
                .map(|i| crate::functions::mean(&scores.iter().map(|(_, s)| s[i]).collect::<Vec<_>>()))
                .collect::<Vec<_>>()
        } else if self.params.return_sensitivity_score {
            if scores.len() != 2 {
                return Err(XaiError::config(
                    "return_sensitivity_score",
                    format!("needs exactly 2 recorded states, got {}", scores.len()),
                ));
            }
            scores[0].1.iter().zip(&scores[1].1).map(|(orig, rand)| rand / orig).collect()
        } else {
            return Ok(None);
        };
        if self.core.config.return_aggregate {
            return Ok(Some(MetricOutput::Aggregate(Score::Value((self.core.aggregate_func)(&values)))));
        }
        Ok(Some(MetricOutput::Scores(values.into_iter().map(Score::Value).collect())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_images;
    use crate::reference::{saliency_explainer, ConstantClassifier, DenseClassifier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn differing_layers(a: &StateDict, b: &StateDict) -> Vec<String> {
        let mut layers: Vec<String> = a
            .iter()
            .filter(|(k, v)| b.get(*k) != Some(*v))
            .filter_map(|(k, _)| k.split('.').next().map(str::to_string))
            .collect();
        layers.dedup();
        layers
    }

    fn walk_states(order: LayerOrder) -> (StateDict, Vec<StateDict>) {
        let mut model = DenseClassifier::new(&[4, 3, 3, 2], 0);
        let original = model.state_dict();
        let mut states = Vec::new();
        {
            let mut walk = LayerRandomisation::new(&mut model, order, 7);
            while walk.advance().unwrap().is_some() {
                states.push(walk.model().state_dict());
            }
        }
        assert_eq!(model.state_dict(), original);
        (original, states)
    }

    #[test]
    fn test_independent_randomises_one_layer_at_a_time() {
        let (original, states) = walk_states(LayerOrder::Independent);
        assert_eq!(states.len(), 3);
        for (i, state) in states.iter().enumerate() {
            assert_eq!(differing_layers(&original, state), vec![format!("dense_{}", i)]);
        }
    }

    #[test]
    fn test_cumulative_orders() {
        let (original, top_down) = walk_states(LayerOrder::TopDown);
        let (_, bottom_up) = walk_states(LayerOrder::BottomUp);
        assert_eq!(differing_layers(&original, &top_down[0]), vec!["dense_2"]);
        assert_eq!(differing_layers(&original, &bottom_up[0]), vec!["dense_0"]);
        assert_eq!(differing_layers(&original, &top_down[2]).len(), 3);
        assert_eq!(differing_layers(&original, &bottom_up[2]).len(), 3);
        assert_ne!(top_down[0], bottom_up[0]);
    }

    #[test]
    fn test_restore_on_failing_quality_func() {
        let mut model = DenseClassifier::new(&[16, 4, 2], 1);
        let original = model.state_dict();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let failing: QualityFn = Arc::new(move |a: &ArrayD<f64>, x: &ArrayD<f64>| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                anyhow::bail!("quality function failed");
            }
            quality::gini_coefficient(a, x)
        });
        // One instance and one random sample: the 3rd call grades the first randomised state.
        let mut metric = ModelParameterRandomisation::new(
            ModelParameterRandomisation::default_config().quiet(),
            RandomisationParams {
                nr_samples: 1,
                ..RandomisationParams::default()
            },
        )
        .unwrap()
        .with_quality_func(failing);
        let result = metric.call(
            &mut model,
            EvalInput::new(synthetic_images(1, 1, 4, 4, 0)).with_explain_func(saliency_explainer(1e-3)),
        );
        assert!(result.is_err());
        assert_eq!(model.state_dict(), original);
    }

    #[test]
    fn test_sensitivity_score_uses_last_state() {
        let mut model = DenseClassifier::new(&[16, 4, 2], 3);
        let mut metric = ModelParameterRandomisation::new(
            ModelParameterRandomisation::default_config().quiet(),
            RandomisationParams {
                nr_samples: 2,
                return_sensitivity_score: true,
                ..RandomisationParams::default()
            },
        )
        .unwrap();
        let out = metric
            .call(
                &mut model,
                EvalInput::new(synthetic_images(3, 1, 4, 4, 0)).with_explain_func(saliency_explainer(1e-3)),
            )
            .unwrap();
        assert_eq!(out.keys(), vec![ORIGINAL_KEY, "dense_1"]);
        let ratios = out.evaluation.unwrap().values().unwrap();
        assert_eq!(ratios.len(), 3);
        assert_eq!(out.scores_expl_random.len(), 2);
    }

    #[test]
    fn test_sample_quality_with_aggregate() {
        let mut model = DenseClassifier::new(&[16, 4, 2], 3);
        let mut metric = ModelParameterRandomisation::new(
            ModelParameterRandomisation::default_config().quiet().with_return_aggregate(true),
            RandomisationParams {
                return_sample_quality: true,
                ..RandomisationParams::default()
            },
        )
        .unwrap();
        let out = metric
            .call(
                &mut model,
                EvalInput::new(synthetic_images(2, 1, 4, 4, 0)).with_explain_func(saliency_explainer(1e-3)),
            )
            .unwrap();
        assert!(matches!(out.evaluation, Some(MetricOutput::Aggregate(Score::Value(_)))));
        assert_eq!(metric.all_results().len(), 1);
    }

    #[test]
    fn test_invalid_mode_combinations() {
        let err = ModelParameterRandomisation::new(
            MetricConfig::default().with_return_aggregate(true),
            RandomisationParams::default(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("return_aggregate"));
        assert!(ModelParameterRandomisation::new(
            MetricConfig::default(),
            RandomisationParams {
                return_sample_quality: true,
                return_sensitivity_score: true,
                ..RandomisationParams::default()
            },
        )
        .is_err());
    }

    #[test]
    fn test_model_without_layers_is_rejected() {
        let mut model = ConstantClassifier::new(vec![0.4, 0.6]);
        let mut metric = ModelParameterRandomisation::new(
            ModelParameterRandomisation::default_config().quiet(),
            RandomisationParams::default(),
        )
        .unwrap();
        let err = metric
            .call(
                &mut model,
                EvalInput::new(synthetic_images(2, 1, 4, 4, 0)).with_explain_func(saliency_explainer(1e-3)),
            )
            .unwrap_err();
        assert!(matches!(err, XaiError::Config { .. }));
        assert!(err.to_string().contains("randomisable layer"));
        assert!(metric.all_results().is_empty());
    }
}
