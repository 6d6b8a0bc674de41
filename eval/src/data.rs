// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Input and attribution batches
//!
//! Provides:
//! - The two data modalities a metric can be called with (numeric tensors, plain text)
//! - Matching attribution containers
//! - Seeded synthetic data for demos and tests

use crate::error::{Result, XaiError};
use crate::text::TokenAttribution;
use crate::utils::{batch_array, batch_slice};
use ndarray::{Array, ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A batch of model inputs; all instances share one modality
#[derive(Debug, Clone, PartialEq)]
pub enum InputBatch {
    /// Instances along axis 0
    Numeric(ArrayD<f64>),
    Text(Vec<String>),
}

impl InputBatch {
    pub fn len(&self) -> usize {
        match self {
            InputBatch::Numeric(x) => x.shape().first().copied().unwrap_or(0),
            InputBatch::Text(x) => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, InputBatch::Text(_))
    }

    pub fn as_numeric(&self) -> Result<&ArrayD<f64>> {
        match self {
            InputBatch::Numeric(x) => Ok(x),
            InputBatch::Text(_) => Err(XaiError::DataContract(
                "expected a numeric input batch, got plain text".to_string(),
            )),
        }
    }

    pub fn as_text(&self) -> Result<&[String]> {
        match self {
            InputBatch::Text(x) => Ok(x),
            InputBatch::Numeric(_) => Err(XaiError::DataContract(
                "expected a plain-text input batch, got a numeric tensor".to_string(),
            )),
        }
    }

    /// Split into mini-batches of `batch_size`, keeping order
    pub fn batches(&self, batch_size: usize) -> Vec<InputBatch> {
        match self {
            InputBatch::Numeric(x) => batch_array(x, batch_size)
                .into_iter()
                .map(InputBatch::Numeric)
                .collect(),
            InputBatch::Text(x) => batch_slice(x, batch_size)
                .into_iter()
                .map(InputBatch::Text)
                .collect(),
        }
    }
}

impl From<ArrayD<f64>> for InputBatch {
    fn from(x: ArrayD<f64>) -> Self {
        InputBatch::Numeric(x)
    }
}

impl From<Vec<String>> for InputBatch {
    fn from(x: Vec<String>) -> Self {
        InputBatch::Text(x)
    }
}

/// One explanation per instance
#[derive(Debug, Clone, PartialEq)]
pub enum AttributionBatch {
    Numeric(ArrayD<f64>),
    Text(Vec<TokenAttribution>),
}

impl AttributionBatch {
    pub fn len(&self) -> usize {
        match self {
            AttributionBatch::Numeric(a) => a.shape().first().copied().unwrap_or(0),
            AttributionBatch::Text(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_numeric(&self) -> Result<&ArrayD<f64>> {
        match self {
            AttributionBatch::Numeric(a) => Ok(a),
            AttributionBatch::Text(_) => Err(XaiError::DataContract(
                "expected numeric attributions, got token attributions".to_string(),
            )),
        }
    }

    pub fn as_text(&self) -> Result<&[TokenAttribution]> {
        match self {
            AttributionBatch::Text(a) => Ok(a),
            AttributionBatch::Numeric(_) => Err(XaiError::DataContract(
                "expected token attributions, got a numeric tensor".to_string(),
            )),
        }
    }

    pub fn batches(&self, batch_size: usize) -> Vec<AttributionBatch> {
        match self {
            AttributionBatch::Numeric(a) => batch_array(a, batch_size)
                .into_iter()
                .map(AttributionBatch::Numeric)
                .collect(),
            AttributionBatch::Text(a) => batch_slice(a, batch_size)
                .into_iter()
                .map(AttributionBatch::Text)
                .collect(),
        }
    }

    /// Apply `f` to every score, keeping tokens
    pub fn map_scores(&self, f: impl Fn(f64) -> f64) -> AttributionBatch {
        match self {
            AttributionBatch::Numeric(a) => AttributionBatch::Numeric(a.mapv(&f)),
            AttributionBatch::Text(a) => AttributionBatch::Text(
                a.iter()
                    .map(|t| TokenAttribution::new(t.tokens.clone(), t.scores.mapv(&f)))
                    .collect(),
            ),
        }
    }
}

impl From<ArrayD<f64>> for AttributionBatch {
    fn from(a: ArrayD<f64>) -> Self {
        AttributionBatch::Numeric(a)
    }
}

impl From<Vec<TokenAttribution>> for AttributionBatch {
    fn from(a: Vec<TokenAttribution>) -> Self {
        AttributionBatch::Text(a)
    }
}

/// Uniform [0, 1) images shaped (n, channels, height, width)
pub fn synthetic_images(n: usize, channels: usize, height: usize, width: usize, seed: u64) -> ArrayD<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array::from_shape_simple_fn(IxDyn(&[n, channels, height, width]), || rng.gen::<f64>())
}

/// Uniform [-1, 1) attribution noise of any shape
pub fn synthetic_attributions(shape: &[usize], seed: u64) -> ArrayD<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-1.0..1.0))
}

const WORDS: &[&str] = &[
    "the", "movie", "was", "great", "terrible", "plot", "acting", "really", "not", "boring",
    "wonderful", "story", "and", "a", "film", "bad", "good", "music", "ending", "slow",
];

/// Short sentences drawn from a fixed vocabulary
pub fn synthetic_sentences(n: usize, words_per_sentence: usize, seed: u64) -> Vec<String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            (0..words_per_sentence)
                .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// The vocabulary `synthetic_sentences` draws from
pub fn synthetic_vocabulary() -> Vec<String> {
    WORDS.iter().map(|w| w.to_string()).collect()
}
