// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Parameter and data-contract assertions
//!
//! Each check returns a [`XaiError`] naming the offending parameter together with the
//! observed relationship, so a misconfigured metric fails before any work is done.

use crate::error::{Result, XaiError};
use ndarray::ArrayD;
use std::collections::HashSet;

/// The product of the input shape must be divisible by `features_in_step`
pub fn assert_features_in_step(features_in_step: usize, input_shape: &[usize]) -> Result<()> {
    let size: usize = input_shape.iter().product();
    if features_in_step == 0 || size % features_in_step != 0 {
        return Err(XaiError::config(
            "features_in_step",
            format!(
                "set 'features_in_step' so that the modulo remainder returns zero given the product of the input shape ({} % {} = {})",
                size,
                features_in_step,
                if features_in_step == 0 { size } else { size % features_in_step }
            ),
        ));
    }
    Ok(())
}

/// The product of the input shape must be divisible by `max_steps_per_input`
pub fn assert_max_steps(max_steps_per_input: usize, input_shape: &[usize]) -> Result<()> {
    let size: usize = input_shape.iter().product();
    if max_steps_per_input == 0 || size % max_steps_per_input != 0 {
        return Err(XaiError::config(
            "max_steps_per_input",
            format!(
                "set 'max_steps_per_input' so that the modulo remainder returns zero given the product of the input shape ({} % {} != 0)",
                size, max_steps_per_input
            ),
        ));
    }
    Ok(())
}

/// A patch, given as one size for every axis or one size per axis, must tile the shape
pub fn assert_patch_size(patch_size: &[usize], shape: &[usize]) -> Result<()> {
    let patch: Vec<usize> = match patch_size.len() {
        0 => {
            return Err(XaiError::config(
                "patch_size",
                "patch_size has to be either a scalar or a 1d-sequence",
            ))
        }
        1 if shape.len() != 1 => vec![patch_size[0]; shape.len()],
        n if n != shape.len() => {
            return Err(XaiError::config(
                "patch_size",
                format!(
                    "patch_size sequence length does not match shape length ({} != {})",
                    n,
                    shape.len()
                ),
            ))
        }
        _ => patch_size.to_vec(),
    };
    let size: usize = shape.iter().product();
    let patch_volume: usize = patch.iter().product();
    if patch_volume == 0 || size % patch_volume != 0 {
        return Err(XaiError::config(
            "patch_size",
            format!(
                "set 'patch_size' so that the input shape modulo remainder returns 0 [prod({:?}) % prod({:?}) != 0 => {} % {} != 0]",
                shape, patch, size, patch_volume
            ),
        ));
    }
    Ok(())
}

/// Segmentation algorithms must produce more than one segment
pub fn assert_nr_segments(nr_segments: usize) -> Result<()> {
    if nr_segments <= 1 {
        return Err(XaiError::config(
            "nr_segments",
            format!(
                "the number of segments from the segmentation algorithm must be more than one, got {}",
                nr_segments
            ),
        ));
    }
    Ok(())
}

/// A perturbation that leaves the input untouched makes a removal curve meaningless
pub fn assert_perturbation_caused_change(x: &ArrayD<f64>, x_perturbed: &ArrayD<f64>) -> Result<()> {
    let changed = x.len() != x_perturbed.len()
        || x.iter().zip(x_perturbed.iter()).any(|(a, b)| a != b);
    if !changed {
        return Err(XaiError::config(
            "perturb_func",
            "the settings for perturbing input didn't cause change in input; reconsider the parameter settings",
        ));
    }
    Ok(())
}

/// Layer order must name one of the supported traversals
pub fn assert_layer_order(layer_order: &str) -> Result<()> {
    layer_order.parse::<crate::config::LayerOrder>().map(|_| ())
}

/// Labels must come one per input
pub fn assert_targets(n_inputs: usize, n_targets: usize) -> Result<()> {
    if n_inputs != n_targets {
        return Err(XaiError::DataContract(format!(
            "'y_batch' should have the same number of samples as 'x_batch' ({} != {})",
            n_targets, n_inputs
        )));
    }
    Ok(())
}

/// Attributions must be non-degenerate and share dimensions with the inputs
///
/// Shapes are compared with the batch axis stripped; the attribution may match a leading or
/// a trailing run of the input axes. All-zero, all-one, constant and all-negative batches are
/// rejected.
pub fn assert_attributions(x_batch: &ArrayD<f64>, a_batch: &ArrayD<f64>) -> Result<()> {
    assert_attributions_with(x_batch, a_batch, false)
}

/// [`assert_attributions`], optionally accepting batches where every value is negative
pub fn assert_attributions_with(x_batch: &ArrayD<f64>, a_batch: &ArrayD<f64>, allow_all_negative: bool) -> Result<()> {
    let x_shape = x_batch.shape();
    let a_shape = a_batch.shape();
    if x_shape.first() != a_shape.first() {
        return Err(XaiError::DataContract(format!(
            "the inputs 'x_batch' and attributions 'a_batch' should include the same number of samples ({:?} != {:?})",
            x_shape.first(),
            a_shape.first()
        )));
    }
    if !shares_dimensions(&x_shape[1..], &a_shape[1..]) {
        return Err(XaiError::DataContract(format!(
            "the inputs 'x_batch' and attributions 'a_batch' should share dimensions ({:?} vs {:?})",
            &x_shape[1..],
            &a_shape[1..]
        )));
    }
    if a_batch.iter().all(|&v| v == 0.0) {
        return Err(XaiError::DataContract(
            "the elements in the attribution vector are all equal to zero, which may cause inconsistent results since many metrics rely on ordering; recompute the explanations".to_string(),
        ));
    }
    if a_batch.iter().all(|&v| v == 1.0) {
        return Err(XaiError::DataContract(
            "the elements in the attribution vector are all equal to one, which may cause inconsistent results since many metrics rely on ordering; recompute the explanations".to_string(),
        ));
    }
    let distinct: HashSet<u64> = a_batch.iter().map(|v| v.to_bits()).collect();
    if distinct.len() <= 1 {
        return Err(XaiError::DataContract(
            "the attributions are uniformly distributed, which may cause inconsistent results since many metrics rely on ordering; recompute the explanations".to_string(),
        ));
    }
    if !allow_all_negative && a_batch.iter().all(|&v| v < 0.0) {
        return Err(XaiError::DataContract(
            "attributions should not all be less than zero".to_string(),
        ));
    }
    Ok(())
}

/// Segmentation masks must be 0/1 valued and share dimensions with the inputs
pub fn assert_segmentations(x_batch: &ArrayD<f64>, s_batch: &ArrayD<f64>) -> Result<()> {
    let x_shape = x_batch.shape();
    let s_shape = s_batch.shape();
    if x_shape.first() != s_shape.first() {
        return Err(XaiError::DataContract(
            "the inputs 'x_batch' and segmentations 's_batch' should include the same number of samples".to_string(),
        ));
    }
    if !shares_dimensions(&x_shape[1..], &s_shape[1..]) {
        return Err(XaiError::DataContract(format!(
            "the inputs 'x_batch' and segmentations 's_batch' should share dimensions ({:?} vs {:?})",
            &x_shape[1..],
            &s_shape[1..]
        )));
    }
    if s_batch.is_empty() {
        return Err(XaiError::DataContract(
            "the segmentation 's_batch' must contain elements".to_string(),
        ));
    }
    if !s_batch.iter().all(|&v| v == 0.0 || v == 1.0) {
        return Err(XaiError::DataContract(
            "the segmentation 's_batch' should contain only [1, 0] or [true, false]".to_string(),
        ));
    }
    Ok(())
}

/// Relative patch sizes must lie in (0, 1]
pub fn assert_max_size(max_size: f64) -> Result<()> {
    if !(max_size > 0.0 && max_size <= 1.0) {
        return Err(XaiError::config(
            "max_size",
            format!("must be between 0 and 1, got {}", max_size),
        ));
    }
    Ok(())
}

/// Metrics that regenerate explanations need an explain function
pub fn assert_explain_func<T>(explain_func: Option<&T>) -> Result<()> {
    if explain_func.is_none() {
        return Err(XaiError::config(
            "explain_func",
            "make sure 'explain_func' is given; it takes the model, x_batch, y_batch and kwargs",
        ));
    }
    Ok(())
}

/// `value` must be smaller than the spatial size of a batched channel-first input
pub fn assert_value_smaller_than_input_size(shape: &[usize], value: usize, value_name: &str) -> Result<()> {
    let size: usize = shape.iter().skip(2).product();
    if value >= size {
        return Err(XaiError::config(
            value_name,
            format!("'{}' must be smaller than input size [{} >= {}]", value_name, value, size),
        ));
    }
    Ok(())
}

/// Indexed axes must be consecutive and include the first or the last axis
pub fn assert_indexed_axes(ndim: usize, indexed_axes: &[usize]) -> Result<()> {
    if indexed_axes.len() > ndim {
        return Err(XaiError::config(
            "indexed_axes",
            format!("{} axes given for an array of rank {}", indexed_axes.len(), ndim),
        ));
    }
    let (first, last) = match (indexed_axes.first(), indexed_axes.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return Ok(()),
    };
    if indexed_axes.iter().enumerate().any(|(i, &a)| a != first + i) {
        return Err(XaiError::config(
            "indexed_axes",
            format!("make sure indexed_axes contains consecutive axes, got {:?}", indexed_axes),
        ));
    }
    if first != 0 && last + 1 != ndim {
        return Err(XaiError::config(
            "indexed_axes",
            format!(
                "make sure indexed_axes contains either the first or last axis of the array, got {:?} for rank {}",
                indexed_axes, ndim
            ),
        ));
    }
    Ok(())
}

/// Plain-text perturbations only make sense for text classifiers
pub fn assert_plain_text_perturbation_requires_text_model(plain_text: bool, text_model: bool) -> Result<()> {
    if plain_text && !text_model {
        return Err(XaiError::config(
            "perturb_func",
            "a plain-text perturbation was configured but the model is not a text classifier",
        ));
    }
    Ok(())
}

fn shares_dimensions(x_shape: &[usize], other: &[usize]) -> bool {
    let n = x_shape.len();
    (0..=n).any(|k| x_shape[k..] == *other || x_shape[..k] == *other)
}
