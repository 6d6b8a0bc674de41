// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reference models for demos and tests
//!
//! Implements:
//! - Constant classifier (same logits for every input)
//! - Dense ReLU network with named, randomisable layers
//! - Whitespace tokenizer and a bag-of-embeddings text classifier
//! - Finite-difference saliency and occlusion explain functions
//!
//! All models are seeded so evaluations over them are reproducible.

use crate::config::Kwargs;
use crate::explain::Explainer;
use crate::model::{Classifier, LayerSelection, StateDict};
use crate::text::{Encoding, TextClassifier, TextInput, TokenAttribution, Tokenizer};
use anyhow::{bail, Context};
use ndarray::{concatenate, Array, Array1, Array2, Array3, ArrayD, Axis, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Returns the same logits for every instance
#[derive(Debug, Clone)]
pub struct ConstantClassifier {
    logits: Vec<f64>,
    training: bool,
}

impl ConstantClassifier {
    pub fn new(logits: Vec<f64>) -> Self {
        Self {
            logits,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

impl Classifier for ConstantClassifier {
    fn forward(&self, x: &ArrayD<f64>, _kwargs: &Kwargs) -> anyhow::Result<Array2<f64>> {
        let n = x.shape().first().copied().unwrap_or(0);
        let classes = self.logits.len();
        Ok(Array2::from_shape_fn((n, classes), |(_, c)| self.logits[c]))
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn state_dict(&self) -> StateDict {
        let mut params = StateDict::new();
        params.insert(
            "logits".to_string(),
            Array::from_vec(self.logits.clone()).into_dyn(),
        );
        params
    }

    fn load_state_dict(&mut self, params: &StateDict) -> anyhow::Result<()> {
        let logits = params.get("logits").context("missing parameter 'logits'")?;
        self.logits = logits.iter().copied().collect();
        Ok(())
    }

    fn randomisable_layers(&self) -> Vec<String> {
        Vec::new()
    }

    fn randomise_layer(&mut self, layer: &str, _rng: &mut ChaCha8Rng) -> anyhow::Result<()> {
        bail!("constant classifier has no layer '{}'", layer)
    }
}

/// Fully connected ReLU network over flattened input
///
/// Layer `dense_i` holds `dense_i.weight` shaped (out, in) and `dense_i.bias` shaped (out).
#[derive(Debug, Clone)]
pub struct DenseClassifier {
    weights: Vec<Array2<f64>>,
    biases: Vec<Array1<f64>>,
    training: bool,
}

fn init_layer(rng: &mut ChaCha8Rng, fan_in: usize, fan_out: usize) -> (Array2<f64>, Array1<f64>) {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    let weight = Array2::from_shape_simple_fn((fan_out, fan_in), || rng.gen_range(-bound..bound));
    let bias = Array1::from_shape_simple_fn(fan_out, || rng.gen_range(-bound..bound));
    (weight, bias)
}

impl DenseClassifier {
    /// `sizes` lists the input width, every hidden width and the number of classes
    pub fn new(sizes: &[usize], seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut weights = Vec::new();
        let mut biases = Vec::new();
        for pair in sizes.windows(2) {
            let (w, b) = init_layer(&mut rng, pair[0], pair[1]);
            weights.push(w);
            biases.push(b);
        }
        Self {
            weights,
            biases,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn num_layers(&self) -> usize {
        self.weights.len()
    }

    fn layer_name(index: usize) -> String {
        format!("dense_{}", index)
    }

    fn layer_index(&self, layer: &str) -> anyhow::Result<usize> {
        layer
            .strip_prefix("dense_")
            .and_then(|i| i.parse::<usize>().ok())
            .filter(|&i| i < self.weights.len())
            .with_context(|| format!("unknown layer '{}'", layer))
    }

    fn flatten(&self, x: &ArrayD<f64>) -> anyhow::Result<Array2<f64>> {
        let n = x.shape().first().copied().unwrap_or(0);
        let features = self.weights.first().map_or(0, |w| w.ncols());
        if x.len() != n * features {
            bail!(
                "expected {} features per instance, got input of shape {:?}",
                features,
                x.shape()
            );
        }
        Ok(x.as_standard_layout().into_owned().into_shape((n, features))?)
    }

    /// Activations after every layer; ReLU on all but the last
    fn activations(&self, x: &ArrayD<f64>) -> anyhow::Result<Vec<Array2<f64>>> {
        let mut h = self.flatten(x)?;
        let mut out = Vec::with_capacity(self.weights.len());
        let last = self.weights.len().saturating_sub(1);
        for (i, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            h = h.dot(&w.t()) + b;
            if i < last {
                h.mapv_inplace(|v| v.max(0.0));
            }
            out.push(h.clone());
        }
        Ok(out)
    }
}

impl Classifier for DenseClassifier {
    fn forward(&self, x: &ArrayD<f64>, _kwargs: &Kwargs) -> anyhow::Result<Array2<f64>> {
        self.activations(x)?
            .pop()
            .context("dense classifier has no layers")
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn state_dict(&self) -> StateDict {
        let mut params = StateDict::new();
        for (i, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            let name = Self::layer_name(i);
            params.insert(format!("{}.weight", name), w.clone().into_dyn());
            params.insert(format!("{}.bias", name), b.clone().into_dyn());
        }
        params
    }

    fn load_state_dict(&mut self, params: &StateDict) -> anyhow::Result<()> {
        for i in 0..self.weights.len() {
            let name = Self::layer_name(i);
            let w = params
                .get(&format!("{}.weight", name))
                .with_context(|| format!("missing parameter '{}.weight'", name))?;
            let b = params
                .get(&format!("{}.bias", name))
                .with_context(|| format!("missing parameter '{}.bias'", name))?;
            if w.shape() != self.weights[i].shape() || b.shape() != self.biases[i].shape() {
                bail!("parameter shapes of layer '{}' do not match", name);
            }
            self.weights[i] = w.clone().into_dimensionality()?;
            self.biases[i] = b.clone().into_dimensionality()?;
        }
        Ok(())
    }

    fn randomisable_layers(&self) -> Vec<String> {
        (0..self.weights.len()).map(Self::layer_name).collect()
    }

    fn randomise_layer(&mut self, layer: &str, rng: &mut ChaCha8Rng) -> anyhow::Result<()> {
        let i = self.layer_index(layer)?;
        let (fan_out, fan_in) = self.weights[i].dim();
        let (w, b) = init_layer(rng, fan_in, fan_out);
        self.weights[i] = w;
        self.biases[i] = b;
        Ok(())
    }

    fn hidden_representations(&self, x: &ArrayD<f64>, selection: &LayerSelection) -> anyhow::Result<Array2<f64>> {
        let activations = self.activations(x)?;
        let selected: Vec<_> = activations
            .iter()
            .enumerate()
            .filter(|(i, _)| selection.selects(*i, &Self::layer_name(*i)))
            .map(|(_, a)| a.view())
            .collect();
        if selected.is_empty() {
            bail!("no hidden layer matches the layer selection");
        }
        Ok(concatenate(Axis(1), &selected)?)
    }
}

/// Saliency by central finite differences of the target logit
pub fn saliency_explainer(step: f64) -> Explainer {
    Explainer::numeric(move |model: &dyn Classifier, x: &ArrayD<f64>, y: &[usize], kwargs: &Kwargs| {
        let n = x.shape().first().copied().unwrap_or(0);
        if y.len() != n {
            bail!("saliency needs one target per instance ({} != {})", y.len(), n);
        }
        let instance_shape = x.shape()[1..].to_vec();
        let size: usize = instance_shape.iter().product();
        let mut out = ArrayD::zeros(x.raw_dim());
        for (i, &target) in y.iter().enumerate() {
            let xi: Vec<f64> = x.index_axis(Axis(0), i).iter().copied().collect();
            let mut probes = Vec::with_capacity(2 * size * size);
            for j in 0..size {
                for sign in [1.0, -1.0] {
                    let mut probe = xi.clone();
                    probe[j] += sign * step;
                    probes.extend(probe);
                }
            }
            let mut shape = vec![2 * size];
            shape.extend_from_slice(&instance_shape);
            let logits = model.forward(&Array::from_shape_vec(IxDyn(&shape), probes)?, kwargs)?;
            if target >= logits.ncols() {
                bail!("target class {} is out of range for {} classes", target, logits.ncols());
            }
            let grad: Vec<f64> = (0..size)
                .map(|j| (logits[[2 * j, target]] - logits[[2 * j + 1, target]]) / (2.0 * step))
                .collect();
            let grad = Array::from_shape_vec(IxDyn(&instance_shape), grad)?;
            out.index_axis_mut(Axis(0), i).assign(&grad);
        }
        Ok(out)
    })
}

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";

/// Lower-cased whitespace tokenizer over a fixed vocabulary
#[derive(Debug, Clone)]
pub struct WhitespaceTokenizer {
    vocab: Vec<String>,
    ids: HashMap<String, u32>,
}

impl WhitespaceTokenizer {
    pub fn new(words: &[String]) -> Self {
        let mut vocab: Vec<String> = [PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN]
            .iter()
            .map(|t| t.to_string())
            .collect();
        for w in words {
            let w = w.to_lowercase();
            if !vocab.contains(&w) {
                vocab.push(w);
            }
        }
        let ids = vocab
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        Self { vocab, ids }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn id_of(&self, token: &str) -> u32 {
        self.ids.get(token).copied().unwrap_or(1)
    }
}

impl Tokenizer for WhitespaceTokenizer {
    fn batch_encode(&self, text: &[String], add_special_tokens: bool) -> anyhow::Result<Encoding> {
        let mut input_ids: Vec<Vec<u32>> = text
            .iter()
            .map(|t| {
                let mut ids: Vec<u32> = t
                    .split_whitespace()
                    .map(|w| self.id_of(&w.to_lowercase()))
                    .collect();
                if add_special_tokens {
                    ids.insert(0, self.id_of(CLS_TOKEN));
                    ids.push(self.id_of(SEP_TOKEN));
                }
                ids
            })
            .collect();
        let len = input_ids.iter().map(Vec::len).max().unwrap_or(0);
        let attention_mask = input_ids
            .iter_mut()
            .map(|ids| {
                let real = ids.len();
                ids.resize(len, 0);
                (0..len).map(|i| u8::from(i < real)).collect()
            })
            .collect();
        Ok(Encoding {
            input_ids,
            attention_mask,
        })
    }

    fn batch_decode(&self, ids: &[Vec<u32>]) -> anyhow::Result<Vec<String>> {
        Ok(ids
            .iter()
            .map(|row| {
                self.convert_ids_to_tokens(row)
                    .into_iter()
                    .filter(|t| t != PAD_TOKEN && t != CLS_TOKEN && t != SEP_TOKEN)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect())
    }

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&i| {
                self.vocab
                    .get(i as usize)
                    .cloned()
                    .unwrap_or_else(|| UNK_TOKEN.to_string())
            })
            .collect()
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }
}

/// Mean of token embeddings under the attention mask, then a linear layer
#[derive(Debug, Clone)]
pub struct BagOfEmbeddingsClassifier {
    tokenizer: WhitespaceTokenizer,
    embeddings: Array2<f64>,
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl BagOfEmbeddingsClassifier {
    pub fn new(vocabulary: &[String], dim: usize, classes: usize, seed: u64) -> Self {
        let tokenizer = WhitespaceTokenizer::new(vocabulary);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let embeddings = Array2::from_shape_simple_fn((tokenizer.vocab_size(), dim), || rng.gen_range(-1.0..1.0));
        let weight = Array2::from_shape_simple_fn((classes, dim), || rng.gen_range(-1.0..1.0));
        let bias = Array1::from_shape_simple_fn(classes, || rng.gen_range(-0.1..0.1));
        Self {
            tokenizer,
            embeddings,
            weight,
            bias,
        }
    }

    fn pool(&self, embeddings: &Array3<f64>, attention_mask: &[Vec<u8>]) -> anyhow::Result<Array2<f64>> {
        let (n, tokens, dim) = embeddings.dim();
        if attention_mask.len() != n {
            bail!("attention mask has {} rows for {} instances", attention_mask.len(), n);
        }
        let mut pooled = Array2::zeros((n, dim));
        for (i, mask) in attention_mask.iter().enumerate() {
            let mut count = 0.0;
            for t in 0..tokens {
                if mask.get(t).copied().unwrap_or(0) == 0 {
                    continue;
                }
                let row = embeddings.index_axis(Axis(0), i);
                let mut target = pooled.row_mut(i);
                target += &row.row(t);
                count += 1.0;
            }
            if count > 0.0 {
                pooled.row_mut(i).mapv_inplace(|v| v / count);
            }
        }
        Ok(pooled)
    }
}

impl TextClassifier for BagOfEmbeddingsClassifier {
    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn predict(&self, text: &[String]) -> anyhow::Result<Array2<f64>> {
        let encoding = self.tokenizer.batch_encode(text, true)?;
        let embeddings = self.embedding_lookup(&encoding.input_ids)?;
        self.predict_embeddings(&embeddings, &encoding.attention_mask)
    }

    fn embedding_lookup(&self, input_ids: &[Vec<u32>]) -> anyhow::Result<Array3<f64>> {
        let n = input_ids.len();
        let tokens = input_ids.iter().map(Vec::len).max().unwrap_or(0);
        let dim = self.embeddings.ncols();
        let mut out = Array3::zeros((n, tokens, dim));
        for (i, ids) in input_ids.iter().enumerate() {
            for (t, &id) in ids.iter().enumerate() {
                let id = id as usize;
                if id >= self.embeddings.nrows() {
                    bail!("token id {} is outside the vocabulary", id);
                }
                out.index_axis_mut(Axis(0), i)
                    .row_mut(t)
                    .assign(&self.embeddings.row(id));
            }
        }
        Ok(out)
    }

    fn predict_embeddings(&self, embeddings: &Array3<f64>, attention_mask: &[Vec<u8>]) -> anyhow::Result<Array2<f64>> {
        let pooled = self.pool(embeddings, attention_mask)?;
        Ok(pooled.dot(&self.weight.t()) + &self.bias)
    }

    fn hidden_representations(&self, text: &[String], _selection: &LayerSelection) -> anyhow::Result<Array2<f64>> {
        let encoding = self.tokenizer.batch_encode(text, true)?;
        let embeddings = self.embedding_lookup(&encoding.input_ids)?;
        self.pool(&embeddings, &encoding.attention_mask)
    }

    fn hidden_representations_embeddings(
        &self,
        embeddings: &Array3<f64>,
        attention_mask: &[Vec<u8>],
        _selection: &LayerSelection,
    ) -> anyhow::Result<Array2<f64>> {
        self.pool(embeddings, attention_mask)
    }
}

/// Drop in the target logit when each token's embedding is zeroed
fn occlusion_scores(
    model: &dyn TextClassifier,
    embeddings: &Array3<f64>,
    attention_mask: &[Vec<u8>],
    y: &[usize],
) -> anyhow::Result<Vec<Array1<f64>>> {
    let (n, tokens, _) = embeddings.dim();
    if y.len() != n {
        bail!("occlusion needs one target per instance ({} != {})", y.len(), n);
    }
    let base = model.predict_embeddings(embeddings, attention_mask)?;
    let mut out = Vec::with_capacity(n);
    for (i, &target) in y.iter().enumerate() {
        let real = attention_mask[i].iter().filter(|&&m| m != 0).count().min(tokens);
        let instance = embeddings.index_axis(Axis(0), i).to_owned();
        let mut probes = Vec::with_capacity(real);
        for t in 0..real {
            let mut probe = instance.clone();
            probe.row_mut(t).fill(0.0);
            probes.push(probe.insert_axis(Axis(0)));
        }
        if probes.is_empty() {
            out.push(Array1::zeros(0));
            continue;
        }
        let views: Vec<_> = probes.iter().map(|p| p.view()).collect();
        let batch = concatenate(Axis(0), &views)?;
        let masks = vec![attention_mask[i].clone(); real];
        let logits = model.predict_embeddings(&batch, &masks)?;
        if target >= logits.ncols() {
            bail!("target class {} is out of range for {} classes", target, logits.ncols());
        }
        out.push(Array1::from_shape_fn(real, |t| base[[i, target]] - logits[[t, target]]));
    }
    Ok(out)
}

/// Token occlusion for text classifiers, on plain text or on embeddings
pub fn occlusion_explainer() -> Explainer {
    Explainer::text(|model: &dyn TextClassifier, x: TextInput<'_>, y: &[usize], _kwargs: &Kwargs| {
        match x {
            TextInput::Plain(text) => {
                let encoding = model.tokenizer().batch_encode(text, true)?;
                let embeddings = model.embedding_lookup(&encoding.input_ids)?;
                let scores = occlusion_scores(model, &embeddings, &encoding.attention_mask, y)?;
                Ok(scores
                    .into_iter()
                    .zip(&encoding.input_ids)
                    .map(|(s, ids)| {
                        let tokens = model.tokenizer().convert_ids_to_tokens(&ids[..s.len()]);
                        TokenAttribution::new(tokens, s)
                    })
                    .collect())
            }
            TextInput::Embeddings {
                embeddings,
                attention_mask,
            } => Ok(occlusion_scores(model, embeddings, attention_mask, y)?
                .into_iter()
                .map(TokenAttribution::from_scores)
                .collect()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_vocabulary;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_dense_state_dict_round_trip() {
        let mut model = DenseClassifier::new(&[4, 3, 2], 7);
        let original = model.state_dict();
        assert_eq!(original.len(), 4);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        model.randomise_layer("dense_1", &mut rng).unwrap();
        assert_ne!(model.state_dict()["dense_1.weight"], original["dense_1.weight"]);
        assert_eq!(model.state_dict()["dense_0.weight"], original["dense_0.weight"]);
        model.load_state_dict(&original).unwrap();
        assert_eq!(model.state_dict(), original);
        assert!(model.randomise_layer("conv_9", &mut rng).is_err());
    }

    #[test]
    fn test_dense_forward_and_hidden() {
        let model = DenseClassifier::new(&[4, 3, 2], 7);
        let x = Array::zeros(IxDyn(&[5, 1, 2, 2]));
        assert_eq!(model.forward(&x, &Kwargs::new()).unwrap().shape(), &[5, 2]);
        let h = model.hidden_representations(&x, &LayerSelection::all()).unwrap();
        assert_eq!(h.shape(), &[5, 5]);
        let h = model
            .hidden_representations(&x, &LayerSelection::names(vec!["dense_0".to_string()]))
            .unwrap();
        assert_eq!(h.shape(), &[5, 3]);
        assert!(model.forward(&Array::zeros(IxDyn(&[1, 3])), &Kwargs::new()).is_err());
    }

    #[test]
    fn test_saliency_of_linear_model_is_its_weights() {
        let model = DenseClassifier::new(&[3, 2], 3);
        let explainer = saliency_explainer(1e-3);
        let x = Array::from_shape_vec(IxDyn(&[1, 3]), vec![0.2, -0.4, 0.9]).unwrap();
        let a = match explainer {
            Explainer::Numeric(f) => f(&model, &x, &[1], &Kwargs::new()).unwrap(),
            Explainer::Text(_) => panic!("expected a numeric explainer"),
        };
        let w = &model.state_dict()["dense_0.weight"];
        for j in 0..3 {
            assert_abs_diff_eq!(a[[0, j]], w[[1, j]], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_tokenizer_special_tokens_and_padding() {
        let tok = WhitespaceTokenizer::new(&synthetic_vocabulary());
        let text = vec!["the movie".to_string(), "good".to_string()];
        let plain = tok.batch_encode(&text, false).unwrap();
        assert_eq!(plain.num_tokens(), 2);
        assert_eq!(plain.attention_mask[1], vec![1, 0]);
        let special = tok.batch_encode(&text, true).unwrap();
        assert_eq!(special.num_tokens(), 4);
        assert_eq!(tok.convert_ids_to_tokens(&special.input_ids[0])[0], CLS_TOKEN);
        assert_eq!(tok.batch_decode(&special.input_ids).unwrap(), text);
        assert_eq!(tok.token_id(UNK_TOKEN), Some(1));
        assert_eq!(tok.batch_encode(&["zzz".to_string()], false).unwrap().input_ids[0], vec![1]);
    }

    #[test]
    fn test_text_classifier_paths_agree() {
        let model = BagOfEmbeddingsClassifier::new(&synthetic_vocabulary(), 8, 2, 0);
        let text = vec!["the plot was slow".to_string(), "great film".to_string()];
        let direct = model.predict(&text).unwrap();
        let (embeddings, encoding) = crate::text::get_embeddings(&model, &text, true).unwrap();
        let via = model.predict_embeddings(&embeddings, &encoding.attention_mask).unwrap();
        for (a, b) in direct.iter().zip(via.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_occlusion_one_score_per_token() {
        let model = BagOfEmbeddingsClassifier::new(&synthetic_vocabulary(), 8, 2, 0);
        let text = vec!["the plot was slow".to_string(), "great film".to_string()];
        let a = match occlusion_explainer() {
            Explainer::Text(f) => f(&model, TextInput::Plain(&text), &[0, 1], &Kwargs::new()).unwrap(),
            Explainer::Numeric(_) => panic!("expected a text explainer"),
        };
        assert_eq!(a[0].len(), 6);
        assert_eq!(a[1].len(), 4);
        assert_eq!(a[1].tokens[1], "great");
    }
}
