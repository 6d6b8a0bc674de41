// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Text classifier capability interface
//!
//! Text models are driven either with plain strings or with token embeddings. Tokenizer
//! calls always state whether special tokens are added, so no shared tokenizer state is
//! ever changed during an evaluation.

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::model::LayerSelection;

/// Token ids and attention mask, padded to the longest sequence of the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Padded sequence length
    pub fn num_tokens(&self) -> usize {
        self.input_ids.first().map_or(0, |ids| ids.len())
    }
}

pub trait Tokenizer {
    fn batch_encode(&self, text: &[String], add_special_tokens: bool) -> anyhow::Result<Encoding>;

    fn batch_decode(&self, ids: &[Vec<u32>]) -> anyhow::Result<Vec<String>>;

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String>;

    fn token_id(&self, token: &str) -> Option<u32>;

    /// Tokens of one string, as the model sees them
    fn split_into_tokens(&self, text: &str, add_special_tokens: bool) -> anyhow::Result<Vec<String>> {
        let encoding = self.batch_encode(&[text.to_string()], add_special_tokens)?;
        Ok(encoding
            .input_ids
            .first()
            .map(|ids| self.convert_ids_to_tokens(ids))
            .unwrap_or_default())
    }
}

/// A trained text classifier
pub trait TextClassifier {
    fn tokenizer(&self) -> &dyn Tokenizer;

    /// Logits for plain-text input, shaped (batch, classes)
    fn predict(&self, text: &[String]) -> anyhow::Result<Array2<f64>>;

    /// Embedding vectors for token ids, shaped (batch, tokens, embedding)
    fn embedding_lookup(&self, input_ids: &[Vec<u32>]) -> anyhow::Result<Array3<f64>>;

    /// Logits for embedded input
    fn predict_embeddings(
        &self,
        embeddings: &Array3<f64>,
        attention_mask: &[Vec<u8>],
    ) -> anyhow::Result<Array2<f64>>;

    fn hidden_representations(
        &self,
        _text: &[String],
        _selection: &LayerSelection,
    ) -> anyhow::Result<Array2<f64>> {
        anyhow::bail!("this text classifier does not expose hidden representations")
    }

    fn hidden_representations_embeddings(
        &self,
        _embeddings: &Array3<f64>,
        _attention_mask: &[Vec<u8>],
        _selection: &LayerSelection,
    ) -> anyhow::Result<Array2<f64>> {
        anyhow::bail!("this text classifier does not expose hidden representations")
    }
}

/// Embed plain text through the model's own tokenizer
pub fn get_embeddings(
    model: &dyn TextClassifier,
    text: &[String],
    add_special_tokens: bool,
) -> anyhow::Result<(Array3<f64>, Encoding)> {
    let encoding = model.tokenizer().batch_encode(text, add_special_tokens)?;
    let embeddings = model.embedding_lookup(&encoding.input_ids)?;
    Ok((embeddings, encoding))
}

/// Text handed to a text explain function
#[derive(Debug, Clone, Copy)]
pub enum TextInput<'a> {
    Plain(&'a [String]),
    Embeddings {
        embeddings: &'a Array3<f64>,
        attention_mask: &'a [Vec<u8>],
    },
}

impl TextInput<'_> {
    pub fn len(&self) -> usize {
        match self {
            TextInput::Plain(text) => text.len(),
            TextInput::Embeddings { embeddings, .. } => embeddings.shape()[0],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-token relevance scores of one text instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAttribution {
    pub tokens: Vec<String>,
    pub scores: Array1<f64>,
}

impl TokenAttribution {
    pub fn new(tokens: Vec<String>, scores: Array1<f64>) -> Self {
        Self { tokens, scores }
    }

    /// Scores only; used for embedding input where tokens are not recoverable
    pub fn from_scores(scores: Array1<f64>) -> Self {
        Self {
            tokens: Vec::new(),
            scores,
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Scores zero-padded or truncated to `len`
    pub fn padded_scores(&self, len: usize) -> Array1<f64> {
        Array1::from_shape_fn(len, |i| self.scores.get(i).copied().unwrap_or(0.0))
    }
}

/// Stack token scores into (batch, tokens), padding to the longest instance
pub fn stack_token_scores(attributions: &[TokenAttribution], min_len: usize) -> Array2<f64> {
    let len = attributions
        .iter()
        .map(|a| a.len())
        .max()
        .unwrap_or(0)
        .max(min_len);
    let mut out = Array2::zeros((attributions.len(), len));
    for (mut row, attribution) in out.rows_mut().into_iter().zip(attributions) {
        row.assign(&attribution.padded_scores(len));
    }
    out
}
