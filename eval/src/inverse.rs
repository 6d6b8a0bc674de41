// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Inverse estimation
//!
//! Runs a wrapped metric on the original attributions and again on inverted ones, and
//! reports `scores_ori - scores_inv`. A metric that tracks attribution quality should
//! score the inversion clearly worse.

use crate::config::{warn_parameterisation, InverseMethod, MetricConfig};
use crate::data::AttributionBatch;
use crate::error::{Result, XaiError};
use crate::pipeline::{
    aggregate_scores, default_batch_preprocess, general_preprocess, BatchedMetric, EvalInput, MetricCore,
    MetricOutput, ModelRef, PreparedData, Score,
};
use crate::utils::argsort_ascending;
use ndarray::{concatenate, ArrayD, ArrayView, Axis, IxDyn};
use serde::{Deserialize, Serialize};

/// Invert every instance (axis 0) of `a`
///
/// Sign-flip negates each value. Value-swap keeps the multiset of values per instance
/// but reverses their ranking: the position of the k-th smallest value receives the
/// k-th largest.
pub fn invert_attributions(a: &ArrayD<f64>, method: InverseMethod) -> ArrayD<f64> {
    match method {
        InverseMethod::SignFlip => a.mapv(|v| -v),
        InverseMethod::ValueSwap => {
            let mut out = a.clone();
            if out.ndim() == 0 {
                return out;
            }
            for mut row in out.outer_iter_mut() {
                let values: Vec<f64> = row.iter().copied().collect();
                let order = argsort_ascending(&values);
                let n = order.len();
                let mut swapped = vec![0.0; n];
                for (k, &idx) in order.iter().enumerate() {
                    swapped[idx] = values[order[n - 1 - k]];
                }
                for (dst, src) in row.iter_mut().zip(swapped) {
                    *dst = src;
                }
            }
            out
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InverseParams {
    pub inverse_method: InverseMethod,
    /// Reduce each score difference to its mean
    pub return_mean_per_sample: bool,
    /// Reduce each score difference to the area under it
    pub return_auc_per_sample: bool,
}

pub struct InverseEstimation<M: BatchedMetric> {
    core: MetricCore,
    params: InverseParams,
    metric: M,
}

fn concat_instances(parts: &[ArrayD<f64>]) -> Result<ArrayD<f64>> {
    let views: Vec<ArrayView<f64, IxDyn>> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

impl<M: BatchedMetric> InverseEstimation<M> {
    pub fn new(config: MetricConfig, params: InverseParams, mut metric: M) -> Result<Self> {
        if params.return_mean_per_sample && params.return_auc_per_sample {
            return Err(XaiError::config(
                "return_auc_per_sample",
                "only one of 'return_mean_per_sample' and 'return_auc_per_sample' can be set",
            ));
        }
        if metric.config().abs {
            return Err(XaiError::config(
                "abs",
                format!(
                    "the wrapped metric {} discards the sign of attributions; set 'abs' to false",
                    metric.name()
                ),
            ));
        }
        if metric.config().return_aggregate {
            if !config.disable_warnings {
                tracing::warn!(
                    metric = metric.name(),
                    "The wrapped metric cannot return an aggregate score, setting return_aggregate to false"
                );
            }
            metric.core_mut().config.return_aggregate = false;
        }
        warn_parameterisation(
            &config,
            "Inverse Estimation",
            "the inversion method 'inverse_method' and the parameters of the wrapped metric",
        );
        Ok(Self {
            core: MetricCore::new(config),
            params,
            metric,
        })
    }

    pub fn name(&self) -> &'static str {
        "InverseEstimation"
    }

    pub fn config(&self) -> &MetricConfig {
        &self.core.config
    }

    pub fn params(&self) -> &InverseParams {
        &self.params
    }

    pub fn metric(&self) -> &M {
        &self.metric
    }

    pub fn all_results(&self) -> &[MetricOutput] {
        &self.core.all_results
    }

    /// Canonical channel-first input with labels and attributions filled in
    fn complete_input(&self, model: ModelRef<'_>, input: EvalInput) -> Result<EvalInput> {
        let template = input.clone();
        let (prepared, mut ctx) = general_preprocess(&self.core.config, model, input)?;
        let PreparedData { model: wrapped, batches, .. } = prepared;

        let mut xs = Vec::with_capacity(batches.len());
        let mut ys = Vec::new();
        let mut as_ = Vec::with_capacity(batches.len());
        let mut ss = Vec::new();
        for raw in batches {
            let batch = default_batch_preprocess(&self.core, &wrapped, raw, &mut ctx)?;
            xs.push(batch.x.as_numeric()?.clone());
            ys.extend(batch.y);
            as_.push(batch.a.as_numeric()?.clone());
            if let Some(s) = batch.s {
                ss.push(s);
            }
        }
        Ok(EvalInput {
            x_batch: concat_instances(&xs)?.into(),
            y_batch: Some(ys),
            a_batch: Some(AttributionBatch::Numeric(concat_instances(&as_)?)),
            s_batch: if ss.is_empty() { None } else { Some(concat_instances(&ss)?) },
            channel_first: Some(true),
            explain_func_kwargs: Some(ctx.explain_func_kwargs),
            ..template
        })
    }

    pub fn call(&mut self, model: ModelRef<'_>, input: EvalInput) -> Result<MetricOutput> {
        if matches!(model, ModelRef::Text(_)) {
            return Err(XaiError::Unsupported(
                "inverse estimation is implemented for numeric classifiers".to_string(),
            ));
        }
        if input.a_batch.is_none() && input.explain_func.is_none() {
            return Err(XaiError::DataContract(
                "'a_batch' or an explain function must be provided to run the inverse estimation".to_string(),
            ));
        }
        let n = input.x_batch.len();
        let input = self.complete_input(model, input)?;
        tracing::info!(
            metric = self.name(),
            wrapped = self.metric.name(),
            instances = n,
            method = ?self.params.inverse_method,
            "Evaluating metric"
        );

        let scores_ori = self.metric.call(model, input.clone())?;
        if scores_ori.len() != n {
            return Err(XaiError::shape(
                format!("{} scores", n),
                format!("{} scores", scores_ori.len()),
            ));
        }
        self.metric.core_mut().all_results.clear();

        let method = self.params.inverse_method;
        let a_inv = input
            .a_batch
            .as_ref()
            .map(|a| a.as_numeric().map(|a| invert_attributions(a, method)))
            .transpose()?;
        let inverted = EvalInput {
            a_batch: a_inv.map(AttributionBatch::Numeric),
            explain_func: input.explain_func.as_ref().map(|e| e.inverted(method)),
            allow_negative_attributions: true,
            ..input
        };
        let scores_inv = self.metric.call(model, inverted)?;

        let (Some(ori), Some(inv)) = (scores_ori.scores(), scores_inv.scores()) else {
            return Err(XaiError::DataContract(
                "the wrapped metric returned an aggregate instead of per-instance scores".to_string(),
            ));
        };
        if ori.len() != inv.len() {
            return Err(XaiError::shape(ori.len(), inv.len()));
        }
        let mut scores = ori
            .iter()
            .zip(inv)
            .map(|(o, i)| o.checked_sub(i))
            .collect::<Result<Vec<Score>>>()?;
        if self.params.return_mean_per_sample {
            scores = scores.iter().map(|s| Score::Value(s.mean())).collect();
        } else if self.params.return_auc_per_sample {
            scores = scores.iter().map(|s| Score::Value(s.auc())).collect();
        }

        let output = if self.core.config.return_aggregate {
            MetricOutput::Aggregate(aggregate_scores(&scores, &self.core.aggregate_func)?)
        } else {
            MetricOutput::Scores(scores)
        };
        tracing::info!(metric = self.name(), "Metric evaluation complete");
        self.core.all_results.push(output.clone());
        Ok(output)
    }
}
