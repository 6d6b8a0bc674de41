// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Token Flipping for text classifiers
//!
//! Pruning replaces tokens with the mask token from least to most relevant; activation
//! starts from an all-mask sentence and restores tokens from most to least relevant. After
//! every flipped token the logit of the explained class is recorded, giving one curve per
//! instance.

use crate::config::MetricConfig;
use crate::error::{Result, XaiError};
use crate::pipeline::{BatchedMetric, CallContext, EvalBatch, MetricCore, RawBatch, Score, WrappedModel};
use crate::utils::{argsort_ascending, argsort_descending, calculate_auc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipTask {
    #[default]
    Pruning,
    Activation,
}

impl fmt::Display for FlipTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlipTask::Pruning => f.write_str("pruning"),
            FlipTask::Activation => f.write_str("activation"),
        }
    }
}

impl FromStr for FlipTask {
    type Err = XaiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pruning" => Ok(FlipTask::Pruning),
            "activation" => Ok(FlipTask::Activation),
            other => Err(XaiError::config(
                "task",
                format!("unknown value '{}', allowed are: pruning, activation", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFlippingParams {
    pub task: FlipTask,
    pub mask_token: String,
    /// Reduce each curve to its area
    pub return_auc_per_sample: bool,
}

impl Default for TokenFlippingParams {
    fn default() -> Self {
        Self {
            task: FlipTask::Pruning,
            mask_token: "[UNK]".to_string(),
            return_auc_per_sample: false,
        }
    }
}

pub struct TokenFlipping {
    core: MetricCore,
    params: TokenFlippingParams,
}

impl TokenFlipping {
    pub fn new(config: MetricConfig, params: TokenFlippingParams) -> Result<Self> {
        if params.mask_token.is_empty() {
            return Err(XaiError::config("mask_token", "must not be empty"));
        }
        Ok(Self {
            core: MetricCore::new(config),
            params,
        })
    }

    /// Configuration with normalisation off, as token flipping ranks raw scores
    pub fn default_config() -> MetricConfig {
        MetricConfig::default().with_normalise(false)
    }

    pub fn params(&self) -> &TokenFlippingParams {
        &self.params
    }
}

impl BatchedMetric for TokenFlipping {
    fn name(&self) -> &'static str {
        "TokenFlipping"
    }

    fn core(&self) -> &MetricCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MetricCore {
        &mut self.core
    }

    fn custom_preprocess(&self, model: &WrappedModel<'_>, _batches: &[RawBatch], _ctx: &mut CallContext) -> Result<()> {
        let text_model = model.as_text()?;
        if text_model.tokenizer().token_id(&self.params.mask_token).is_none() {
            return Err(XaiError::config(
                "mask_token",
                format!("'{}' is not in the tokenizer's vocabulary", self.params.mask_token),
            ));
        }
        Ok(())
    }

    fn evaluate_batch(&self, model: &WrappedModel<'_>, batch: &EvalBatch, _ctx: &mut CallContext) -> Result<Vec<Score>> {
        let text_model = model.as_text()?;
        let tokenizer = text_model.tokenizer();
        let x = batch.x.as_text()?;
        let a = batch.a.as_text()?;
        let mask_id = tokenizer.token_id(&self.params.mask_token).ok_or_else(|| {
            XaiError::config("mask_token", format!("'{}' is not in the vocabulary", self.params.mask_token))
        })?;

        let encoding = tokenizer.batch_encode(x, true)?;
        let num_tokens = encoding.num_tokens();
        let orders: Vec<Vec<usize>> = a
            .iter()
            .map(|attribution| {
                let scores: Vec<f64> = attribution.scores.iter().copied().collect();
                let order = match self.params.task {
                    FlipTask::Pruning => argsort_ascending(&scores),
                    FlipTask::Activation => argsort_descending(&scores),
                };
                order.into_iter().filter(|&t| t < num_tokens).collect()
            })
            .collect();
        let steps = orders.iter().map(Vec::len).max().unwrap_or(0);

        let mut ids = encoding.input_ids.clone();
        if self.params.task == FlipTask::Activation {
            for (row, mask) in ids.iter_mut().zip(&encoding.attention_mask) {
                for (id, &m) in row.iter_mut().zip(mask) {
                    if m != 0 {
                        *id = mask_id;
                    }
                }
            }
        }

        let mut curves = vec![Vec::with_capacity(steps); batch.len()];
        for step in 0..steps {
            for (i, order) in orders.iter().enumerate() {
                if let Some(&t) = order.get(step) {
                    ids[i][t] = match self.params.task {
                        FlipTask::Pruning => mask_id,
                        FlipTask::Activation => encoding.input_ids[i][t],
                    };
                }
            }
            let embeddings = text_model.embedding_lookup(&ids)?;
            let logits = text_model.predict_embeddings(&embeddings, &encoding.attention_mask)?;
            for (i, &label) in batch.y.iter().enumerate() {
                let value = logits
                    .get((i, label))
                    .copied()
                    .ok_or_else(|| XaiError::shape(format!("class {}", label), logits.shape()))?;
                curves[i].push(value);
            }
            tracing::debug!(step, steps, task = %self.params.task, "Tokens flipped");
        }

        Ok(curves
            .into_iter()
            .map(|curve| {
                if self.params.return_auc_per_sample {
                    Score::Value(calculate_auc(&curve, 1.0))
                } else {
                    Score::Curve(curve)
                }
            })
            .collect())
    }
}
