// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Demonstration CLI: evaluates explanation metrics on synthetic data
//!
//! Usage:
//!   xai-eval --metric road --seed 42
//!   xai-eval --metric all --samples 20 --format json

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use xai_eval::data::{synthetic_images, synthetic_sentences, synthetic_vocabulary};
use xai_eval::metrics::{
    AvgSensitivity, AvgSensitivityParams, LocalLipschitzEstimate, LocalLipschitzParams, RelativeStability,
    RelativeStabilityParams, Road, RoadParams, TokenFlipping, TokenFlippingParams,
};
use xai_eval::reference::{occlusion_explainer, saliency_explainer, BagOfEmbeddingsClassifier, DenseClassifier};
use xai_eval::utils::nan_mean;
use xai_eval::{
    BatchedMetric, EvalInput, InverseEstimation, InverseParams, LayerSelection, MetricConfig, MetricOutput,
    ModelParameterRandomisation, ModelRef, RandomisationParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MetricChoice {
    Road,
    Lle,
    Ris,
    Ros,
    Rrs,
    AvgSensitivity,
    TokenFlipping,
    Randomisation,
    Inverse,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "xai-eval")]
#[command(about = "Evaluate attribution explanations with batched metrics")]
#[command(version)]
struct Args {
    /// Metric to run
    #[arg(short, long, value_enum, default_value = "all")]
    metric: MetricChoice,

    /// Random seed for reproducibility
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Perturbation samples per instance for robustness metrics
    #[arg(long, default_value_t = 10)]
    samples: usize,

    /// Number of synthetic instances
    #[arg(short, long, default_value_t = 8)]
    instances: usize,

    /// Mini-batch size
    #[arg(short, long, default_value_t = 4)]
    batch_size: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct MetricSummary {
    metric: String,
    instances: usize,
    mean: f64,
    scores: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Report {
    timestamp: String,
    seed: u64,
    results: Vec<MetricSummary>,
}

const HEIGHT: usize = 8;
const WIDTH: usize = 8;

fn summarise(metric: &str, output: &MetricOutput) -> Result<MetricSummary> {
    let values: Vec<f64> = match output {
        MetricOutput::Scores(scores) => scores.iter().flat_map(|s| s.as_slice().to_vec()).collect(),
        MetricOutput::Aggregate(score) => score.as_slice().to_vec(),
    };
    Ok(MetricSummary {
        metric: metric.to_string(),
        instances: output.len(),
        mean: nan_mean(&values),
        scores: serde_json::to_value(output).context("failed to serialise scores")?,
    })
}

fn run_batched(
    metric: &mut dyn BatchedMetric,
    model: ModelRef<'_>,
    input: EvalInput,
) -> Result<MetricSummary> {
    let name = metric.name();
    let output = metric
        .call(model, input)
        .with_context(|| format!("{} evaluation failed", name))?;
    summarise(name, &output)
}

fn run(choice: MetricChoice, args: &Args) -> Result<Vec<MetricSummary>> {
    let config = MetricConfig::default().with_seed(args.seed).quiet();
    let mut model = DenseClassifier::new(&[HEIGHT * WIDTH, 16, 3], args.seed);
    let x = synthetic_images(args.instances, 1, HEIGHT, WIDTH, args.seed);
    let input = || {
        EvalInput::new(x.clone())
            .with_explain_func(saliency_explainer(1e-3))
            .with_batch_size(args.batch_size)
    };
    let stability_config = RelativeStability::default_config().with_seed(args.seed).quiet();
    let stability = RelativeStabilityParams {
        nr_samples: args.samples,
        ..RelativeStabilityParams::default()
    };

    let mut results = Vec::new();
    let wants = |m: MetricChoice| choice == m || choice == MetricChoice::All;

    if wants(MetricChoice::Road) {
        let mut road = Road::new(config.clone(), RoadParams::default())?;
        results.push(run_batched(&mut road, ModelRef::numeric(&model), input())?);
    }
    if wants(MetricChoice::Lle) {
        let params = LocalLipschitzParams {
            nr_samples: args.samples,
            ..LocalLipschitzParams::default()
        };
        let mut lle = LocalLipschitzEstimate::new(config.clone(), params)?;
        results.push(run_batched(&mut lle, ModelRef::numeric(&model), input())?);
    }
    if wants(MetricChoice::Ris) {
        let mut ris = RelativeStability::input(stability_config.clone(), stability.clone())?;
        results.push(run_batched(&mut ris, ModelRef::numeric(&model), input())?);
    }
    if wants(MetricChoice::Ros) {
        let mut ros = RelativeStability::output(stability_config.clone(), stability.clone())?;
        results.push(run_batched(&mut ros, ModelRef::numeric(&model), input())?);
    }
    if wants(MetricChoice::Rrs) {
        let mut rrs =
            RelativeStability::representation(stability_config.clone(), stability.clone(), LayerSelection::all())?;
        results.push(run_batched(&mut rrs, ModelRef::numeric(&model), input())?);
    }
    if wants(MetricChoice::AvgSensitivity) {
        let params = AvgSensitivityParams {
            nr_samples: args.samples,
            ..AvgSensitivityParams::default()
        };
        let mut sensitivity = AvgSensitivity::new(config.clone(), params)?;
        results.push(run_batched(&mut sensitivity, ModelRef::numeric(&model), input())?);
    }
    if wants(MetricChoice::TokenFlipping) {
        let text_model = BagOfEmbeddingsClassifier::new(&synthetic_vocabulary(), 16, 2, args.seed);
        let sentences = synthetic_sentences(args.instances, 6, args.seed);
        let mut flipping = TokenFlipping::new(
            TokenFlipping::default_config().with_seed(args.seed).quiet(),
            TokenFlippingParams::default(),
        )?;
        let text_input = EvalInput::new(sentences)
            .with_explain_func(occlusion_explainer())
            .with_batch_size(args.batch_size);
        results.push(run_batched(&mut flipping, ModelRef::text(&text_model), text_input)?);
    }
    if wants(MetricChoice::Inverse) {
        let road = Road::new(config.clone(), RoadParams::default())?;
        let params = InverseParams {
            return_auc_per_sample: true,
            ..InverseParams::default()
        };
        let mut inverse = InverseEstimation::new(config.clone(), params, road)?;
        let output = inverse
            .call(ModelRef::numeric(&model), input())
            .context("InverseEstimation evaluation failed")?;
        results.push(summarise(inverse.name(), &output)?);
    }
    if wants(MetricChoice::Randomisation) {
        let params = RandomisationParams {
            nr_samples: args.samples,
            return_sample_quality: true,
            ..RandomisationParams::default()
        };
        let mut randomisation = ModelParameterRandomisation::new(
            ModelParameterRandomisation::default_config().with_seed(args.seed).quiet(),
            params,
        )?;
        let output = randomisation
            .call(&mut model, input())
            .context("ModelParameterRandomisation evaluation failed")?;
        for (layer, scores) in &output.scores_expl_model_randomised {
            tracing::info!(layer = %layer, mean_quality = nan_mean(scores), "Randomised state graded");
        }
        if let Some(evaluation) = &output.evaluation {
            results.push(summarise("ModelParameterRandomisation", evaluation)?);
        }
    }
    Ok(results)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    tracing::info!("Explanation Metric Evaluation");
    tracing::info!("=============================");
    tracing::info!("Metric: {:?}", args.metric);
    tracing::info!("Seed: {}", args.seed);
    tracing::info!("Instances: {}", args.instances);

    let results = run(args.metric, &args)?;
    let report = Report {
        timestamp: chrono::Utc::now().to_rfc3339(),
        seed: args.seed,
        results,
    };

    match args.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialise report")?
            );
        }
        OutputFormat::Text => {
            println!("\n{}", "=".repeat(60));
            println!("EVALUATION SUMMARY ({})", report.timestamp);
            println!("{}", "=".repeat(60));
            println!("{:<32} {:>10} {:>14}", "Metric", "Instances", "Mean score");
            println!("{:-<60}", "");
            for result in &report.results {
                println!("{:<32} {:>10} {:>14.6}", result.metric, result.instances, result.mean);
            }
            println!("{:-<60}", "");
        }
    }

    Ok(())
}
