// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model capability interface for numeric classifiers
//!
//! A [`Classifier`] is the user's model: a forward pass plus access to its learnable
//! parameters. [`ModelInterface`] binds a borrowed classifier to the layout, softmax and
//! forward-pass options of one metric call.

use crate::config::Kwargs;
use crate::error::{Result, XaiError};
use crate::utils::{infer_channel_first, make_channel_first, make_channel_last};
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// Learnable parameters keyed by parameter name
pub type StateDict = BTreeMap<String, ArrayD<f64>>;

/// Layout a classifier expects for multi-channel input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    First,
    Last,
}

/// Which hidden layers to read representations from; `None` in both means every layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSelection {
    pub layer_names: Option<Vec<String>>,
    pub layer_indices: Option<Vec<usize>>,
}

impl LayerSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn names(names: Vec<String>) -> Self {
        Self {
            layer_names: Some(names),
            layer_indices: None,
        }
    }

    pub fn indices(indices: Vec<usize>) -> Self {
        Self {
            layer_names: None,
            layer_indices: Some(indices),
        }
    }

    /// Whether layer `index` called `name` is selected
    pub fn selects(&self, index: usize, name: &str) -> bool {
        match (&self.layer_names, &self.layer_indices) {
            (None, None) => true,
            (names, indices) => {
                names.as_ref().map_or(false, |n| n.iter().any(|l| l == name))
                    || indices.as_ref().map_or(false, |i| i.contains(&index))
            }
        }
    }
}

/// A trained numeric classifier
///
/// Layers are reported in definition order (input side first). Implementations that do
/// not expose hidden layers keep the default `hidden_representations`.
pub trait Classifier {
    /// Forward pass on a batch in this classifier's [`ChannelOrder`]; returns (batch, classes)
    fn forward(&self, x: &ArrayD<f64>, kwargs: &Kwargs) -> anyhow::Result<Array2<f64>>;

    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::First
    }

    /// Models still in training mode refuse to be evaluated
    fn is_training(&self) -> bool {
        false
    }

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, params: &StateDict) -> anyhow::Result<()>;

    /// Names of layers with learnable parameters, in definition order
    fn randomisable_layers(&self) -> Vec<String>;

    /// Re-initialise the parameters of one layer
    fn randomise_layer(&mut self, layer: &str, rng: &mut ChaCha8Rng) -> anyhow::Result<()>;

    /// Flattened activations of the selected hidden layers, concatenated per instance
    fn hidden_representations(
        &self,
        _x: &ArrayD<f64>,
        _selection: &LayerSelection,
    ) -> anyhow::Result<Array2<f64>> {
        anyhow::bail!("this classifier does not expose hidden representations")
    }
}

/// A classifier bound to the options of one metric call
#[derive(Clone)]
pub struct ModelInterface<'a> {
    model: &'a dyn Classifier,
    channel_first: bool,
    softmax: bool,
    device: Option<String>,
    predict_kwargs: Kwargs,
}

impl<'a> ModelInterface<'a> {
    /// `channel_first` is the layout of the tensors this interface will be handed
    pub fn new(
        model: &'a dyn Classifier,
        channel_first: bool,
        softmax: bool,
        device: Option<String>,
        predict_kwargs: Kwargs,
    ) -> Self {
        Self {
            model,
            channel_first,
            softmax,
            device,
            predict_kwargs,
        }
    }

    pub fn get_model(&self) -> &'a dyn Classifier {
        self.model
    }

    pub fn channel_first(&self) -> bool {
        self.channel_first
    }

    pub fn softmax(&self) -> bool {
        self.softmax
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn state_dict(&self) -> StateDict {
        self.model.state_dict()
    }

    /// Forward pass in inference mode, optionally followed by a softmax
    pub fn predict(&self, x: &ArrayD<f64>) -> Result<Array2<f64>> {
        if self.model.is_training() {
            return Err(XaiError::Model(
                "the model needs to be in evaluation mode before it can be scored".to_string(),
            ));
        }
        let x = self.to_model_layout(x.clone());
        let mut kwargs = self.predict_kwargs.clone();
        if let Some(device) = &self.device {
            kwargs
                .entry("device".to_string())
                .or_insert_with(|| serde_json::Value::String(device.clone()));
        }
        let logits = self.model.forward(&x, &kwargs)?;
        if logits.nrows() != x.shape()[0] {
            return Err(XaiError::shape(
                format!("{} rows of logits", x.shape()[0]),
                logits.shape(),
            ));
        }
        Ok(if self.softmax { softmax_rows(&logits) } else { logits })
    }

    /// Reshape `x` to `(batch, *shape)` in the layout this interface is bound to
    ///
    /// `channel_first` describes the layout of `shape`; it is inferred when absent. A
    /// channel-first-only classifier cannot be bound to channel-last tensors.
    pub fn shape_input(
        &self,
        x: &ArrayD<f64>,
        shape: &[usize],
        channel_first: Option<bool>,
        batched: bool,
    ) -> Result<ArrayD<f64>> {
        let instance_size: usize = shape.iter().product();
        if instance_size == 0 || x.len() % instance_size != 0 {
            return Err(XaiError::shape(shape, x.shape()));
        }
        let batch = if batched { x.len() / instance_size } else { 1 };
        if !batched && x.len() != instance_size {
            return Err(XaiError::shape(shape, x.shape()));
        }
        let mut target = Vec::with_capacity(shape.len() + 1);
        target.push(batch);
        target.extend_from_slice(shape);
        let reshaped = x
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&target))?;

        let data_channel_first = match channel_first {
            Some(cf) => cf,
            None => infer_channel_first(reshaped.shape())?,
        };
        if !self.channel_first && self.model.channel_order() == ChannelOrder::First {
            return Err(XaiError::Model(
                "channel first order expected for this classifier".to_string(),
            ));
        }
        Ok(if self.channel_first {
            make_channel_first(reshaped, data_channel_first)
        } else {
            make_channel_last(make_channel_first(reshaped, data_channel_first), true)
        })
    }

    /// Activations of the selected hidden layers, shaped (batch, features)
    pub fn hidden_representations(&self, x: &ArrayD<f64>, selection: &LayerSelection) -> Result<Array2<f64>> {
        let x = self.to_model_layout(x.clone());
        Ok(self.model.hidden_representations(&x, selection)?)
    }

    fn to_model_layout(&self, x: ArrayD<f64>) -> ArrayD<f64> {
        match self.model.channel_order() {
            ChannelOrder::First => make_channel_first(x, self.channel_first),
            ChannelOrder::Last => make_channel_last(x, self.channel_first),
        }
    }
}

/// Row-wise softmax, shifted by the row maximum for stability
pub fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f64 = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{ConstantClassifier, DenseClassifier};
    use ndarray::{array, Array};

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let p = softmax_rows(&array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]]);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!(p[[0, 2]] > p[[0, 0]]);
    }

    #[test]
    fn test_predict_refuses_training_mode() {
        let mut model = ConstantClassifier::new(vec![0.1, 0.9]);
        model.set_training(true);
        let wrapped = ModelInterface::new(&model, true, false, None, Kwargs::new());
        let x = Array::zeros(IxDyn(&[2, 1, 4, 4]));
        assert!(matches!(wrapped.predict(&x), Err(XaiError::Model(_))));
    }

    #[test]
    fn test_predict_shape_and_softmax() {
        let model = ConstantClassifier::new(vec![1.0, 3.0]);
        let wrapped = ModelInterface::new(&model, true, true, None, Kwargs::new());
        let x = Array::zeros(IxDyn(&[3, 1, 4, 4]));
        let p = wrapped.predict(&x).unwrap();
        assert_eq!(p.shape(), &[3, 2]);
        assert!((p.row(0).sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_shape_input_unbatched() {
        let model = DenseClassifier::new(&[16, 4, 2], 0);
        let wrapped = ModelInterface::new(&model, true, false, None, Kwargs::new());
        let flat = Array::from_shape_fn(IxDyn(&[16]), |i| i[0] as f64);
        let shaped = wrapped.shape_input(&flat, &[1, 4, 4], Some(true), false).unwrap();
        assert_eq!(shaped.shape(), &[1, 1, 4, 4]);
        assert_eq!(shaped[[0, 0, 1, 2]], 6.0);
        assert!(wrapped.shape_input(&flat, &[1, 3, 3], Some(true), false).is_err());
    }

    #[test]
    fn test_shape_input_channel_conflict() {
        let model = DenseClassifier::new(&[16, 4, 2], 0);
        let wrapped = ModelInterface::new(&model, false, false, None, Kwargs::new());
        let flat = Array::zeros(IxDyn(&[16]));
        assert!(matches!(
            wrapped.shape_input(&flat, &[1, 4, 4], Some(true), false),
            Err(XaiError::Model(_))
        ));
    }

    #[test]
    fn test_layer_selection() {
        assert!(LayerSelection::all().selects(3, "dense_3"));
        let by_name = LayerSelection::names(vec!["dense_0".to_string()]);
        assert!(by_name.selects(0, "dense_0"));
        assert!(!by_name.selects(1, "dense_1"));
        assert!(LayerSelection::indices(vec![1]).selects(1, "x"));
    }
}
