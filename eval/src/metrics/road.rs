// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! ROAD: RemOve And Debias
//!
//! For each percentage p, the top p% most relevant features are removed by noisy linear
//! imputation and the model is asked again. An instance scores 1 at p if the prediction
//! still equals its label, otherwise 0. A faithful explanation makes accuracy drop fast.

use crate::asserts::assert_perturbation_caused_change;
use crate::config::{warn_parameterisation, MetricConfig};
use crate::error::{Result, XaiError};
use crate::functions::perturb::noisy_linear_imputation;
use crate::functions::PerturbFn;
use crate::pipeline::{BatchedMetric, CallContext, EvalBatch, MetricCore, RawBatch, Score, WrappedModel};
use crate::utils::{argmax_rows, argsort_descending, infer_attribution_axes, instance, stack_instances};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadParams {
    /// Percentages of features to remove, each in [0, 100]
    pub percentages: Vec<usize>,
    /// Standard deviation of the imputation noise
    pub noise: f64,
}

impl Default for RoadParams {
    fn default() -> Self {
        Self {
            percentages: (1..100).step_by(2).collect(),
            noise: 0.01,
        }
    }
}

pub struct Road {
    core: MetricCore,
    params: RoadParams,
    perturb_func: PerturbFn,
}

impl Road {
    pub fn new(config: MetricConfig, params: RoadParams) -> Result<Self> {
        if params.percentages.is_empty() {
            return Err(XaiError::config("percentages", "at least one percentage is required"));
        }
        if let Some(p) = params.percentages.iter().find(|&&p| p > 100) {
            return Err(XaiError::config(
                "percentages",
                format!("must lie in [0, 100], got {}", p),
            ));
        }
        if !(params.noise >= 0.0) {
            return Err(XaiError::config("noise", format!("must be non-negative, got {}", params.noise)));
        }
        warn_parameterisation(
            &config,
            "ROAD",
            "the noise of the imputation 'noise' and the removal percentages 'percentages'",
        );
        Ok(Self {
            core: MetricCore::new(config),
            perturb_func: noisy_linear_imputation(params.noise),
            params,
        })
    }

    pub fn with_perturb_func(mut self, perturb_func: PerturbFn) -> Self {
        self.perturb_func = perturb_func;
        self
    }

    pub fn params(&self) -> &RoadParams {
        &self.params
    }

    /// Mean accuracy per percentage over every instance of every recorded call
    ///
    /// Aggregated outputs carry no per-instance curves and are skipped. `None` until a
    /// call has recorded per-instance scores.
    pub fn accuracy_curve(&self) -> Option<BTreeMap<usize, f64>> {
        let curves: Vec<&[f64]> = self
            .core
            .all_results
            .iter()
            .filter_map(|output| output.scores())
            .flatten()
            .map(|s| s.curve())
            .collect::<Option<_>>()?;
        if curves.is_empty() {
            return None;
        }
        let mut accuracy = BTreeMap::new();
        for (step, &p) in self.params.percentages.iter().enumerate() {
            let column: Option<Vec<f64>> = curves.iter().map(|c| c.get(step).copied()).collect();
            accuracy.insert(p, crate::functions::mean(&column?));
        }
        Some(accuracy)
    }
}

impl BatchedMetric for Road {
    fn name(&self) -> &'static str {
        "ROAD"
    }

    fn core(&self) -> &MetricCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MetricCore {
        &mut self.core
    }

    fn custom_preprocess(&self, model: &WrappedModel<'_>, _batches: &[RawBatch], _ctx: &mut CallContext) -> Result<()> {
        model.as_numeric()?;
        Ok(())
    }

    fn evaluate_batch(&self, model: &WrappedModel<'_>, batch: &EvalBatch, ctx: &mut CallContext) -> Result<Vec<Score>> {
        let model = model.as_numeric()?;
        let x = batch.x.as_numeric()?;
        let a = batch.a.as_numeric()?;

        let mut scores = Vec::with_capacity(batch.len());
        for (i, &label) in batch.y.iter().enumerate() {
            let xi = instance(x, i);
            let ai = instance(a, i);
            let axes = infer_attribution_axes(ai.shape(), xi.shape())?;
            let a_size = ai.len();
            let ordered = argsort_descending(&ai.iter().copied().collect::<Vec<_>>());

            let mut perturbed = Vec::with_capacity(self.params.percentages.len());
            for &p in &self.params.percentages {
                let top_k = a_size * p / 100;
                let xp = (self.perturb_func)(&xi, &ordered[..top_k], &axes, &mut ctx.rng)?;
                if top_k > 0 {
                    assert_perturbation_caused_change(&xi, &xp)?;
                }
                perturbed.push(xp);
            }
            let stacked = stack_instances(&perturbed)?;
            let x_input = model.shape_input(&stacked, xi.shape(), Some(true), true)?;
            let predictions = argmax_rows(&model.predict(&x_input)?);
            let curve = predictions
                .into_iter()
                .map(|pred| if pred == label { 1.0 } else { 0.0 })
                .collect();
            scores.push(Score::Curve(curve));
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_attributions, synthetic_images};
    use crate::pipeline::{EvalInput, ModelRef};
    use crate::reference::ConstantClassifier;

    #[test]
    fn test_road_constant_model_keeps_accuracy() {
        let model = ConstantClassifier::new(vec![0.1, 0.9]);
        let mut road = Road::new(
            MetricConfig::default().quiet(),
            RoadParams {
                percentages: vec![10, 50, 90],
                noise: 0.01,
            },
        )
        .unwrap();
        let x = synthetic_images(4, 1, 8, 8, 0);
        let a = synthetic_attributions(&[4, 1, 8, 8], 1);
        let out = road
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(x).with_labels(vec![1, 1, 0, 1]).with_attributions(a),
            )
            .unwrap();
        let scores = out.scores().unwrap();
        assert_eq!(scores.len(), 4);
        assert_eq!(scores[0], Score::Curve(vec![1.0, 1.0, 1.0]));
        assert_eq!(scores[2], Score::Curve(vec![0.0, 0.0, 0.0]));

        let curve = road.accuracy_curve().unwrap();
        assert_eq!(curve.keys().copied().collect::<Vec<_>>(), vec![10, 50, 90]);
        assert_eq!(curve[&50], 0.75);
    }

    #[test]
    fn test_accuracy_curve_spans_all_calls() {
        let model = ConstantClassifier::new(vec![0.1, 0.9]);
        let mut road = Road::new(
            MetricConfig::default().quiet(),
            RoadParams {
                percentages: vec![20, 80],
                noise: 0.01,
            },
        )
        .unwrap();
        assert!(road.accuracy_curve().is_none());
        for labels in [vec![1, 1], vec![0, 0]] {
            road.call(
                ModelRef::numeric(&model),
                EvalInput::new(synthetic_images(2, 1, 4, 4, 0))
                    .with_labels(labels)
                    .with_attributions(synthetic_attributions(&[2, 1, 4, 4], 1)),
            )
            .unwrap();
        }
        let curve = road.accuracy_curve().unwrap();
        assert_eq!(curve[&20], 0.5);
        assert_eq!(curve[&80], 0.5);
    }

    #[test]
    fn test_road_channel_reduced_attributions() {
        let model = ConstantClassifier::new(vec![1.0, 0.0]);
        let mut road = Road::new(
            MetricConfig::default().quiet(),
            RoadParams {
                percentages: vec![0, 25],
                noise: 0.01,
            },
        )
        .unwrap();
        let x = synthetic_images(2, 3, 4, 4, 2);
        let a = synthetic_attributions(&[2, 4, 4], 3);
        let out = road
            .call(ModelRef::numeric(&model), EvalInput::new(x).with_attributions(a))
            .unwrap();
        assert_eq!(out.scores().unwrap()[1], Score::Curve(vec![1.0, 1.0]));
    }

    #[test]
    fn test_road_rejects_bad_percentages() {
        let err = Road::new(
            MetricConfig::default(),
            RoadParams {
                percentages: vec![50, 120],
                noise: 0.01,
            },
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("percentages"));
    }

    #[test]
    fn test_road_default_percentages() {
        let params = RoadParams::default();
        assert_eq!(params.percentages.len(), 50);
        assert_eq!(params.percentages[0], 1);
        assert_eq!(params.percentages[49], 99);
    }
}
