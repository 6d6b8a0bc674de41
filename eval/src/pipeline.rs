// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Batched metric evaluation pipeline
//!
//! Orchestrates one metric call:
//! - General preprocessing (channel order, model wrapping, explain kwargs, mini-batching)
//! - Per-batch preprocessing (missing labels and explanations)
//! - The metric's own `evaluate_batch`
//! - Post-processing, optional aggregation and the per-metric result history
//!
//! Call-scoped state (explain function, kwargs, random generator) lives in a
//! [`CallContext`] that is created per call and handed through every stage.

use crate::asserts::{assert_attributions_with, assert_segmentations, assert_targets};
use crate::config::{Kwargs, MetricConfig};
use crate::data::{AttributionBatch, InputBatch};
use crate::error::{Result, XaiError};
use crate::explain::Explainer;
use crate::functions::{aggregate_mean, normalise, AggregateFn, NormaliseFn};
use crate::model::{Classifier, ModelInterface};
use crate::text::{TextClassifier, TextInput, TokenAttribution};
use crate::utils::{argmax_rows, batch_array, batch_slice, calculate_auc, infer_channel_first, make_channel_first};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{ArrayD, IxDyn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Default number of instances per mini-batch
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// The model a metric is called with
#[derive(Clone, Copy)]
pub enum ModelRef<'a> {
    Numeric(&'a dyn Classifier),
    Text(&'a dyn TextClassifier),
}

impl<'a> ModelRef<'a> {
    pub fn numeric(model: &'a dyn Classifier) -> Self {
        ModelRef::Numeric(model)
    }

    pub fn text(model: &'a dyn TextClassifier) -> Self {
        ModelRef::Text(model)
    }
}

/// The model as seen by a metric during one call
pub enum WrappedModel<'a> {
    Numeric(ModelInterface<'a>),
    Text(&'a dyn TextClassifier),
}

impl<'a> WrappedModel<'a> {
    pub fn is_text(&self) -> bool {
        matches!(self, WrappedModel::Text(_))
    }

    pub fn as_numeric(&self) -> Result<&ModelInterface<'a>> {
        match self {
            WrappedModel::Numeric(m) => Ok(m),
            WrappedModel::Text(_) => Err(XaiError::Unsupported(
                "this operation needs a numeric classifier".to_string(),
            )),
        }
    }

    pub fn as_text(&self) -> Result<&'a dyn TextClassifier> {
        match self {
            WrappedModel::Text(m) => Ok(*m),
            WrappedModel::Numeric(_) => Err(XaiError::Unsupported(
                "this operation needs a text classifier".to_string(),
            )),
        }
    }

    /// Argmax predictions on unperturbed input
    pub fn predict_labels(&self, x: &InputBatch) -> Result<Vec<usize>> {
        let logits = match (self, x) {
            (WrappedModel::Numeric(m), InputBatch::Numeric(x)) => m.predict(x)?,
            (WrappedModel::Text(m), InputBatch::Text(x)) => m.predict(x)?,
            _ => return Err(modality_mismatch()),
        };
        Ok(argmax_rows(&logits))
    }
}

fn modality_mismatch() -> XaiError {
    XaiError::DataContract(
        "numeric classifiers need numeric input and text classifiers need plain-text input".to_string(),
    )
}

/// Score of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Value(f64),
    /// One value per step (percentage, flipped token, ...)
    Curve(Vec<f64>),
}

impl Score {
    pub fn value(&self) -> Option<f64> {
        match self {
            Score::Value(v) => Some(*v),
            Score::Curve(_) => None,
        }
    }

    pub fn curve(&self) -> Option<&[f64]> {
        match self {
            Score::Curve(c) => Some(c),
            Score::Value(_) => None,
        }
    }

    /// All values of this score, one for a scalar
    pub fn as_slice(&self) -> &[f64] {
        match self {
            Score::Value(v) => std::slice::from_ref(v),
            Score::Curve(c) => c,
        }
    }

    pub fn is_nan(&self) -> bool {
        self.as_slice().iter().any(|v| v.is_nan())
    }

    pub fn mean(&self) -> f64 {
        crate::functions::mean(self.as_slice())
    }

    /// Trapezoidal area under the curve with unit spacing
    pub fn auc(&self) -> f64 {
        calculate_auc(self.as_slice(), 1.0)
    }

    /// Element-wise `self - other`
    pub fn checked_sub(&self, other: &Score) -> Result<Score> {
        match (self, other) {
            (Score::Value(a), Score::Value(b)) => Ok(Score::Value(a - b)),
            (Score::Curve(a), Score::Curve(b)) if a.len() == b.len() => {
                Ok(Score::Curve(a.iter().zip(b).map(|(x, y)| x - y).collect()))
            }
            _ => Err(XaiError::shape(self.as_slice().len(), other.as_slice().len())),
        }
    }

    /// Equality that treats NaN as equal to NaN with the same bit pattern
    pub fn bit_eq(&self, other: &Score) -> bool {
        let (a, b) = (self.as_slice(), other.as_slice());
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
    }
}

/// Result of one metric call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricOutput {
    Scores(Vec<Score>),
    Aggregate(Score),
}

impl MetricOutput {
    pub fn scores(&self) -> Option<&[Score]> {
        match self {
            MetricOutput::Scores(s) => Some(s),
            MetricOutput::Aggregate(_) => None,
        }
    }

    pub fn aggregate(&self) -> Option<&Score> {
        match self {
            MetricOutput::Aggregate(s) => Some(s),
            MetricOutput::Scores(_) => None,
        }
    }

    /// Scalar per-instance scores, if every score is a scalar
    pub fn values(&self) -> Option<Vec<f64>> {
        self.scores()?.iter().map(Score::value).collect()
    }

    pub fn len(&self) -> usize {
        match self {
            MetricOutput::Scores(s) => s.len(),
            MetricOutput::Aggregate(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bit_eq(&self, other: &MetricOutput) -> bool {
        match (self, other) {
            (MetricOutput::Scores(a), MetricOutput::Scores(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.bit_eq(y))
            }
            (MetricOutput::Aggregate(a), MetricOutput::Aggregate(b)) => a.bit_eq(b),
            _ => false,
        }
    }
}

/// Reduce scores with `func`; curves are reduced step by step
pub fn aggregate_scores(scores: &[Score], func: &AggregateFn) -> Result<Score> {
    match scores.first() {
        None => Ok(Score::Value(func(&[]))),
        Some(Score::Value(_)) => {
            let values: Option<Vec<f64>> = scores.iter().map(Score::value).collect();
            let values = values.ok_or_else(|| {
                XaiError::DataContract("cannot aggregate a mix of scalar and curve scores".to_string())
            })?;
            Ok(Score::Value(func(&values)))
        }
        Some(Score::Curve(first)) => {
            let steps = first.len();
            let mut out = Vec::with_capacity(steps);
            for step in 0..steps {
                let column: Option<Vec<f64>> = scores
                    .iter()
                    .map(|s| s.curve().and_then(|c| c.get(step).copied()))
                    .collect();
                let column = column.ok_or_else(|| {
                    XaiError::DataContract("cannot aggregate curves of different lengths".to_string())
                })?;
                out.push(func(&column));
            }
            Ok(Score::Curve(out))
        }
    }
}

/// Data and per-call options of one metric call
#[derive(Debug, Clone)]
pub struct EvalInput {
    pub x_batch: InputBatch,
    pub y_batch: Option<Vec<usize>>,
    pub a_batch: Option<AttributionBatch>,
    pub s_batch: Option<ArrayD<f64>>,
    /// Layout of `x_batch`; inferred when absent
    pub channel_first: Option<bool>,
    pub explain_func: Option<Explainer>,
    pub explain_func_kwargs: Option<Kwargs>,
    pub model_predict_kwargs: Option<Kwargs>,
    pub softmax: Option<bool>,
    pub device: Option<String>,
    pub batch_size: usize,
    pub custom_batch: Option<Vec<serde_json::Value>>,
    /// Accept supplied attributions that are negative everywhere
    pub allow_negative_attributions: bool,
}

impl EvalInput {
    pub fn new(x_batch: impl Into<InputBatch>) -> Self {
        Self {
            x_batch: x_batch.into(),
            y_batch: None,
            a_batch: None,
            s_batch: None,
            channel_first: None,
            explain_func: None,
            explain_func_kwargs: None,
            model_predict_kwargs: None,
            softmax: None,
            device: None,
            batch_size: DEFAULT_BATCH_SIZE,
            custom_batch: None,
            allow_negative_attributions: false,
        }
    }

    pub fn with_labels(mut self, y_batch: Vec<usize>) -> Self {
        self.y_batch = Some(y_batch);
        self
    }

    pub fn with_attributions(mut self, a_batch: impl Into<AttributionBatch>) -> Self {
        self.a_batch = Some(a_batch.into());
        self
    }

    pub fn with_segmentations(mut self, s_batch: ArrayD<f64>) -> Self {
        self.s_batch = Some(s_batch);
        self
    }

    pub fn with_channel_first(mut self, channel_first: bool) -> Self {
        self.channel_first = Some(channel_first);
        self
    }

    pub fn with_explain_func(mut self, explain_func: Explainer) -> Self {
        self.explain_func = Some(explain_func);
        self
    }

    pub fn with_explain_func_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.explain_func_kwargs = Some(kwargs);
        self
    }

    pub fn with_predict_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.model_predict_kwargs = Some(kwargs);
        self
    }

    pub fn with_softmax(mut self, softmax: bool) -> Self {
        self.softmax = Some(softmax);
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_custom_batch(mut self, custom_batch: Vec<serde_json::Value>) -> Self {
        self.custom_batch = Some(custom_batch);
        self
    }

    pub fn allow_negative_attributions(mut self, allow: bool) -> Self {
        self.allow_negative_attributions = allow;
        self
    }
}

/// State scoped to one metric call
pub struct CallContext {
    pub explainer: Option<Explainer>,
    pub explain_func_kwargs: Kwargs,
    /// Layout the input arrived in; `None` for text
    pub channel_first: Option<bool>,
    pub batch_size: usize,
    pub rng: ChaCha8Rng,
}

impl CallContext {
    pub fn new(seed: u64) -> Self {
        Self {
            explainer: None,
            explain_func_kwargs: Kwargs::new(),
            channel_first: None,
            batch_size: DEFAULT_BATCH_SIZE,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

/// A mini-batch before labels and explanations are filled in
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub x: InputBatch,
    pub y: Option<Vec<usize>>,
    pub a: Option<AttributionBatch>,
    pub s: Option<ArrayD<f64>>,
    pub custom: Option<Vec<serde_json::Value>>,
}

/// A mini-batch ready for `evaluate_batch`
#[derive(Debug, Clone)]
pub struct EvalBatch {
    pub x: InputBatch,
    pub y: Vec<usize>,
    pub a: AttributionBatch,
    pub s: Option<ArrayD<f64>>,
    pub custom: Option<Vec<serde_json::Value>>,
}

impl EvalBatch {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Output of [`general_preprocess`]
pub struct PreparedData<'a> {
    pub model: WrappedModel<'a>,
    pub batches: Vec<RawBatch>,
    pub n_instances: usize,
}

/// The whole (unbatched) canonical data of a call
pub(crate) struct Canonical<'a> {
    pub model: WrappedModel<'a>,
    pub x: InputBatch,
    pub y: Option<Vec<usize>>,
    pub a: Option<AttributionBatch>,
    pub s: Option<ArrayD<f64>>,
    pub custom: Option<Vec<serde_json::Value>>,
}

/// Validate the call, fix the channel order and wrap the model
pub(crate) fn canonicalise<'a>(
    config: &MetricConfig,
    model: ModelRef<'a>,
    input: EvalInput,
) -> Result<(Canonical<'a>, CallContext)> {
    let EvalInput {
        x_batch,
        y_batch,
        a_batch,
        s_batch,
        channel_first,
        explain_func,
        explain_func_kwargs,
        model_predict_kwargs,
        softmax,
        device,
        batch_size,
        custom_batch,
        allow_negative_attributions,
    } = input;

    if batch_size == 0 {
        return Err(XaiError::config("batch_size", "must be at least 1"));
    }
    let n = x_batch.len();
    if n == 0 {
        return Err(XaiError::DataContract("'x_batch' is empty".to_string()));
    }
    if let Some(y) = &y_batch {
        assert_targets(n, y.len())?;
    }
    if let Some(custom) = &custom_batch {
        if custom.len() != n {
            return Err(XaiError::DataContract(format!(
                "'custom_batch' should have one entry per input ({} != {})",
                custom.len(),
                n
            )));
        }
    }

    let mut ctx = CallContext::new(config.seed);
    ctx.batch_size = batch_size;
    ctx.explainer = explain_func;
    let mut kwargs = explain_func_kwargs.unwrap_or_default();

    let canonical = match (model, x_batch) {
        (ModelRef::Numeric(m), InputBatch::Numeric(x)) => {
            let cf = match channel_first {
                Some(cf) => cf,
                None => infer_channel_first(x.shape())?,
            };
            let x = make_channel_first(x, cf);
            let a = match a_batch {
                None => None,
                Some(AttributionBatch::Numeric(a)) => {
                    let a = if a.ndim() == x.ndim() { make_channel_first(a, cf) } else { a };
                    assert_attributions_with(&x, &a, allow_negative_attributions)?;
                    Some(AttributionBatch::Numeric(a))
                }
                Some(AttributionBatch::Text(_)) => {
                    return Err(XaiError::DataContract(
                        "token attributions were given for numeric input".to_string(),
                    ))
                }
            };
            let s = match s_batch {
                None => None,
                Some(s) => {
                    let s = if s.ndim() == x.ndim() { make_channel_first(s, cf) } else { s };
                    assert_segmentations(&x, &s)?;
                    Some(s)
                }
            };
            if let Some(device) = &device {
                kwargs
                    .entry("device".to_string())
                    .or_insert_with(|| serde_json::Value::String(device.clone()));
            }
            ctx.channel_first = Some(cf);
            let wrapped = ModelInterface::new(
                m,
                true,
                softmax.unwrap_or(false),
                device,
                model_predict_kwargs.unwrap_or_default(),
            );
            Canonical {
                model: WrappedModel::Numeric(wrapped),
                x: InputBatch::Numeric(x),
                y: y_batch,
                a,
                s,
                custom: custom_batch,
            }
        }
        (ModelRef::Text(m), InputBatch::Text(x)) => {
            if let Some(a) = &a_batch {
                let a = a.as_text()?;
                if a.len() != n {
                    return Err(XaiError::DataContract(format!(
                        "the inputs 'x_batch' and attributions 'a_batch' should include the same number of samples ({} != {})",
                        n,
                        a.len()
                    )));
                }
            }
            if s_batch.is_some() {
                return Err(XaiError::Unsupported(
                    "segmentation masks are not defined for plain-text input".to_string(),
                ));
            }
            Canonical {
                model: WrappedModel::Text(m),
                x: InputBatch::Text(x),
                y: y_batch,
                a: a_batch,
                s: None,
                custom: custom_batch,
            }
        }
        _ => return Err(modality_mismatch()),
    };
    ctx.explain_func_kwargs = kwargs;
    Ok((canonical, ctx))
}

/// Canonicalise a call and split it into mini-batches of `batch_size`
pub fn general_preprocess<'a>(
    config: &MetricConfig,
    model: ModelRef<'a>,
    input: EvalInput,
) -> Result<(PreparedData<'a>, CallContext)> {
    let (canonical, ctx) = canonicalise(config, model, input)?;
    let n_instances = canonical.x.len();
    let batch_size = ctx.batch_size;

    let xs = canonical.x.batches(batch_size);
    let mut ys = canonical.y.map(|y| batch_slice(&y, batch_size).into_iter());
    let mut as_ = canonical.a.map(|a| a.batches(batch_size).into_iter());
    let mut ss = canonical.s.map(|s| batch_array(&s, batch_size).into_iter());
    let mut cs = canonical.custom.map(|c| batch_slice(&c, batch_size).into_iter());

    let batches = xs
        .into_iter()
        .map(|x| RawBatch {
            x,
            y: ys.as_mut().and_then(Iterator::next),
            a: as_.as_mut().and_then(Iterator::next),
            s: ss.as_mut().and_then(Iterator::next),
            custom: cs.as_mut().and_then(Iterator::next),
        })
        .collect();

    Ok((
        PreparedData {
            model: canonical.model,
            batches,
            n_instances,
        },
        ctx,
    ))
}

/// Configuration, strategies and result history shared by every batched metric
pub struct MetricCore {
    pub config: MetricConfig,
    pub normalise_func: NormaliseFn,
    pub aggregate_func: AggregateFn,
    pub all_results: Vec<MetricOutput>,
}

impl MetricCore {
    pub fn new(config: MetricConfig) -> Self {
        Self {
            config,
            normalise_func: normalise::by_max(),
            aggregate_func: aggregate_mean(),
            all_results: Vec::new(),
        }
    }

    pub fn with_normalise_func(mut self, normalise_func: NormaliseFn) -> Self {
        self.normalise_func = normalise_func;
        self
    }

    pub fn with_aggregate_func(mut self, aggregate_func: AggregateFn) -> Self {
        self.aggregate_func = aggregate_func;
        self
    }

    /// Normalise then take magnitudes, as configured
    pub fn postprocess_attributions(&self, a: ArrayD<f64>) -> Result<ArrayD<f64>> {
        let mut a = a;
        if self.config.normalise {
            a = (self.normalise_func)(&a)?;
        }
        if self.config.abs {
            a.mapv_inplace(f64::abs);
        }
        Ok(a)
    }

    pub fn postprocess_token_attributions(&self, a: Vec<TokenAttribution>) -> Result<Vec<TokenAttribution>> {
        a.into_iter()
            .map(|t| {
                let len = t.scores.len();
                let row = t.scores.into_shape(IxDyn(&[1, len]))?;
                let scores = self.postprocess_attributions(row)?.into_shape(len)?;
                Ok(TokenAttribution::new(t.tokens, scores))
            })
            .collect()
    }
}

/// Explain a numeric batch with the call's explain function, then post-process
pub fn explain_numeric(
    core: &MetricCore,
    model: &ModelInterface<'_>,
    ctx: &CallContext,
    x: &ArrayD<f64>,
    y: &[usize],
) -> Result<ArrayD<f64>> {
    let f = match &ctx.explainer {
        Some(Explainer::Numeric(f)) => f,
        Some(Explainer::Text(_)) => {
            return Err(XaiError::config(
                "explain_func",
                "a text explain function cannot explain a numeric classifier",
            ))
        }
        None => {
            return Err(XaiError::config(
                "explain_func",
                "explanations are missing and no explain function was given",
            ))
        }
    };
    let a = f(model.get_model(), x, y, &ctx.explain_func_kwargs)?;
    if a.shape().first() != x.shape().first() {
        return Err(XaiError::shape(x.shape().first(), a.shape()));
    }
    core.postprocess_attributions(a)
}

/// Explain text (plain or embedded) with the call's explain function, then post-process
pub fn explain_text(
    core: &MetricCore,
    model: &dyn TextClassifier,
    ctx: &CallContext,
    x: TextInput<'_>,
    y: &[usize],
) -> Result<Vec<TokenAttribution>> {
    let f = match &ctx.explainer {
        Some(Explainer::Text(f)) => f,
        Some(Explainer::Numeric(_)) => {
            return Err(XaiError::config(
                "explain_func",
                "a numeric explain function cannot explain a text classifier",
            ))
        }
        None => {
            return Err(XaiError::config(
                "explain_func",
                "explanations are missing and no explain function was given",
            ))
        }
    };
    let a = f(model, x, y, &ctx.explain_func_kwargs)?;
    if a.len() != x.len() {
        return Err(XaiError::shape(x.len(), a.len()));
    }
    core.postprocess_token_attributions(a)
}

/// Explain a batch in either modality
pub fn explain_batch(
    core: &MetricCore,
    model: &WrappedModel<'_>,
    ctx: &CallContext,
    x: &InputBatch,
    y: &[usize],
) -> Result<AttributionBatch> {
    match (model, x) {
        (WrappedModel::Numeric(m), InputBatch::Numeric(x)) => {
            Ok(AttributionBatch::Numeric(explain_numeric(core, m, ctx, x, y)?))
        }
        (WrappedModel::Text(m), InputBatch::Text(x)) => {
            Ok(AttributionBatch::Text(explain_text(core, *m, ctx, TextInput::Plain(x), y)?))
        }
        _ => Err(modality_mismatch()),
    }
}

/// Fill in missing labels from the model and missing explanations from the explain function
pub fn default_batch_preprocess(
    core: &MetricCore,
    model: &WrappedModel<'_>,
    batch: RawBatch,
    ctx: &mut CallContext,
) -> Result<EvalBatch> {
    let RawBatch { x, y, a, s, custom } = batch;
    let y = match y {
        Some(y) => y,
        None => model.predict_labels(&x)?,
    };
    let a = match a {
        Some(a) => a,
        None => explain_batch(core, model, ctx, &x, &y)?,
    };
    Ok(EvalBatch { x, y, a, s, custom })
}

/// Progress bar over `len` steps, hidden unless `visible`
pub(crate) fn progress_bar(len: u64, visible: bool, label: &str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(format!("Evaluating {}", label));
    pb
}

/// A metric evaluated batch by batch
///
/// Implementors provide `evaluate_batch`; `call` drives preprocessing, the batch loop,
/// post-processing, aggregation and the result history.
pub trait BatchedMetric {
    fn name(&self) -> &'static str;

    fn core(&self) -> &MetricCore;

    fn core_mut(&mut self) -> &mut MetricCore;

    fn config(&self) -> &MetricConfig {
        &self.core().config
    }

    /// Every output returned by this instance so far
    fn all_results(&self) -> &[MetricOutput] {
        &self.core().all_results
    }

    /// Checks that need the whole call, run once before the batch loop
    fn custom_preprocess(
        &self,
        _model: &WrappedModel<'_>,
        _batches: &[RawBatch],
        _ctx: &mut CallContext,
    ) -> Result<()> {
        Ok(())
    }

    fn batch_preprocess(
        &self,
        model: &WrappedModel<'_>,
        batch: RawBatch,
        ctx: &mut CallContext,
    ) -> Result<EvalBatch> {
        default_batch_preprocess(self.core(), model, batch, ctx)
    }

    /// One score per instance of `batch`
    fn evaluate_batch(
        &self,
        model: &WrappedModel<'_>,
        batch: &EvalBatch,
        ctx: &mut CallContext,
    ) -> Result<Vec<Score>>;

    fn batch_postprocess(&self, scores: Vec<Score>, _batch: &EvalBatch) -> Result<Vec<Score>> {
        Ok(scores)
    }

    fn custom_postprocess(&self, scores: Vec<Score>, _ctx: &CallContext) -> Result<Vec<Score>> {
        Ok(scores)
    }

    fn call(&mut self, model: ModelRef<'_>, input: EvalInput) -> Result<MetricOutput> {
        run_metric(self, model, input)
    }
}

/// Drive one call of `metric`
pub fn run_metric<M: BatchedMetric + ?Sized>(
    metric: &mut M,
    model: ModelRef<'_>,
    input: EvalInput,
) -> Result<MetricOutput> {
    let name = metric.name();
    let (prepared, mut ctx) = general_preprocess(metric.config(), model, input)?;
    let PreparedData {
        model,
        batches,
        n_instances,
    } = prepared;
    tracing::info!(
        metric = name,
        instances = n_instances,
        batches = batches.len(),
        "Evaluating metric"
    );

    metric.custom_preprocess(&model, &batches, &mut ctx)?;

    let pb = progress_bar(batches.len() as u64, metric.config().display_progressbar, name);
    let mut scores = Vec::with_capacity(n_instances);
    for (index, raw) in batches.into_iter().enumerate() {
        let batch = metric.batch_preprocess(&model, raw, &mut ctx)?;
        let batch_scores = metric.evaluate_batch(&model, &batch, &mut ctx)?;
        let batch_scores = metric.batch_postprocess(batch_scores, &batch)?;
        if batch_scores.len() != batch.len() {
            return Err(XaiError::shape(
                format!("{} scores", batch.len()),
                format!("{} scores", batch_scores.len()),
            ));
        }
        tracing::debug!(metric = name, batch = index, size = batch.len(), "Batch evaluated");
        scores.extend(batch_scores);
        pb.inc(1);
    }
    pb.finish_and_clear();

    let scores = metric.custom_postprocess(scores, &ctx)?;
    let output = if metric.config().return_aggregate {
        MetricOutput::Aggregate(aggregate_scores(&scores, &metric.core().aggregate_func)?)
    } else {
        MetricOutput::Scores(scores)
    };
    tracing::info!(metric = name, "Metric evaluation complete");
    metric.core_mut().all_results.push(output.clone());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_attributions, synthetic_images};
    use crate::reference::{saliency_explainer, ConstantClassifier, DenseClassifier};
    use ndarray::Array;

    /// Scores each instance with the sum of its attributions
    struct AttributionSum {
        core: MetricCore,
    }

    impl BatchedMetric for AttributionSum {
        fn name(&self) -> &'static str {
            "AttributionSum"
        }

        fn core(&self) -> &MetricCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut MetricCore {
            &mut self.core
        }

        fn evaluate_batch(
            &self,
            _model: &WrappedModel<'_>,
            batch: &EvalBatch,
            _ctx: &mut CallContext,
        ) -> Result<Vec<Score>> {
            let a = batch.a.as_numeric()?;
            Ok(a.outer_iter().map(|row| Score::Value(row.sum())).collect())
        }
    }

    fn metric(config: MetricConfig) -> AttributionSum {
        AttributionSum {
            core: MetricCore::new(config),
        }
    }

    #[test]
    fn test_batches_preserve_order_with_short_tail() {
        let model = ConstantClassifier::new(vec![0.0, 1.0]);
        let x = synthetic_images(5, 1, 4, 4, 0);
        let input = EvalInput::new(x.clone()).with_batch_size(2);
        let (prepared, ctx) = general_preprocess(&MetricConfig::default(), ModelRef::numeric(&model), input).unwrap();
        assert_eq!(prepared.batches.len(), 3);
        assert_eq!(prepared.batches[2].x.len(), 1);
        assert_eq!(
            prepared.batches[2].x.as_numeric().unwrap()[[0, 0, 1, 1]],
            x[[4, 0, 1, 1]]
        );
        assert!(prepared.batches[0].y.is_none());
        assert_eq!(ctx.channel_first, Some(true));
    }

    #[test]
    fn test_channel_last_input_is_made_channel_first() {
        let model = ConstantClassifier::new(vec![0.0, 1.0]);
        let x = Array::from_shape_fn(IxDyn(&[2, 6, 6, 3]), |i| i[3] as f64);
        let (prepared, ctx) = general_preprocess(&MetricConfig::default(), ModelRef::numeric(&model), EvalInput::new(x)).unwrap();
        let x = prepared.batches[0].x.as_numeric().unwrap();
        assert_eq!(x.shape(), &[2, 3, 6, 6]);
        assert_eq!(x[[0, 2, 0, 0]], 2.0);
        assert_eq!(ctx.channel_first, Some(false));
    }

    #[test]
    fn test_device_injected_into_explain_kwargs() {
        let model = ConstantClassifier::new(vec![0.0, 1.0]);
        let input = EvalInput::new(synthetic_images(2, 1, 4, 4, 0)).with_device("cpu");
        let (_, ctx) = general_preprocess(&MetricConfig::default(), ModelRef::numeric(&model), input).unwrap();
        assert_eq!(ctx.explain_func_kwargs["device"], "cpu");

        let mut kwargs = Kwargs::new();
        kwargs.insert("device".to_string(), "cuda:1".into());
        let input = EvalInput::new(synthetic_images(2, 1, 4, 4, 0))
            .with_device("cpu")
            .with_explain_func_kwargs(kwargs);
        let (_, ctx) = general_preprocess(&MetricConfig::default(), ModelRef::numeric(&model), input).unwrap();
        assert_eq!(ctx.explain_func_kwargs["device"], "cuda:1");
    }

    #[test]
    fn test_degenerate_attributions_rejected() {
        let model = ConstantClassifier::new(vec![0.0, 1.0]);
        let input = EvalInput::new(synthetic_images(2, 1, 4, 4, 0))
            .with_labels(vec![0, 1])
            .with_attributions(Array::zeros(IxDyn(&[2, 1, 4, 4])));
        let err = metric(MetricConfig::default())
            .call(ModelRef::numeric(&model), input)
            .unwrap_err();
        assert!(matches!(err, XaiError::DataContract(_)));
    }

    #[test]
    fn test_modality_mismatch() {
        let model = ConstantClassifier::new(vec![0.0, 1.0]);
        let input = EvalInput::new(vec!["some text".to_string()]);
        assert!(general_preprocess(&MetricConfig::default(), ModelRef::numeric(&model), input).is_err());
    }

    #[test]
    fn test_missing_explain_func() {
        let model = ConstantClassifier::new(vec![0.0, 1.0]);
        let input = EvalInput::new(synthetic_images(2, 1, 4, 4, 0));
        let err = metric(MetricConfig::default())
            .call(ModelRef::numeric(&model), input)
            .unwrap_err();
        assert!(err.to_string().contains("explain_func"));
    }

    #[test]
    fn test_one_score_per_instance_and_history() {
        let model = DenseClassifier::new(&[16, 6, 3], 1);
        let x = synthetic_images(7, 1, 4, 4, 3);
        let mut m = metric(MetricConfig::default().with_normalise(false));
        let out = m
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(x.clone())
                    .with_attributions(synthetic_attributions(&[7, 1, 4, 4], 5))
                    .with_batch_size(3),
            )
            .unwrap();
        assert_eq!(out.len(), 7);

        let out = m
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(x)
                    .with_explain_func(saliency_explainer(1e-4))
                    .with_batch_size(4),
            )
            .unwrap();
        assert_eq!(out.len(), 7);
        assert_eq!(m.all_results().len(), 2);
    }

    #[test]
    fn test_labels_inferred_from_model() {
        let model = ConstantClassifier::new(vec![0.2, 0.1, 0.7]);
        let wrapped = WrappedModel::Numeric(ModelInterface::new(&model, true, false, None, Kwargs::new()));
        let x = InputBatch::Numeric(synthetic_images(3, 1, 2, 2, 0));
        assert_eq!(wrapped.predict_labels(&x).unwrap(), vec![2, 2, 2]);
    }

    #[test]
    fn test_aggregate_scores() {
        let mean = aggregate_mean();
        let values = vec![Score::Value(1.0), Score::Value(3.0)];
        assert_eq!(aggregate_scores(&values, &mean).unwrap(), Score::Value(2.0));
        let curves = vec![Score::Curve(vec![1.0, 0.0]), Score::Curve(vec![0.0, 0.0])];
        assert_eq!(aggregate_scores(&curves, &mean).unwrap(), Score::Curve(vec![0.5, 0.0]));
        let mixed = vec![Score::Value(1.0), Score::Curve(vec![1.0])];
        assert!(aggregate_scores(&mixed, &mean).is_err());
        let nan = vec![Score::Value(f64::NAN), Score::Value(1.0)];
        assert!(aggregate_scores(&nan, &mean).unwrap().is_nan());
    }

    #[test]
    fn test_return_aggregate() {
        let model = ConstantClassifier::new(vec![0.0, 1.0]);
        let mut m = metric(MetricConfig::default().with_normalise(false).with_return_aggregate(true));
        let a = Array::from_shape_fn(IxDyn(&[2, 2]), |i| (i[0] * 2 + i[1]) as f64);
        let out = m
            .call(
                ModelRef::numeric(&model),
                EvalInput::new(Array::zeros(IxDyn(&[2, 2]))).with_attributions(a),
            )
            .unwrap();
        assert_eq!(out, MetricOutput::Aggregate(Score::Value(3.0)));
    }

    #[test]
    fn test_score_helpers() {
        let a = Score::Curve(vec![1.0, 2.0, 3.0]);
        let b = Score::Curve(vec![0.0, 1.0, 1.0]);
        assert_eq!(a.checked_sub(&b).unwrap(), Score::Curve(vec![1.0, 1.0, 2.0]));
        assert!(a.checked_sub(&Score::Value(1.0)).is_err());
        assert_eq!(a.mean(), 2.0);
        assert_eq!(a.auc(), 4.0);
        assert!(Score::Value(f64::NAN).bit_eq(&Score::Value(f64::NAN)));
    }
}
