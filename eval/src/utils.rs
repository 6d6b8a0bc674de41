// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Array helpers shared by the pipeline and the metrics

use crate::error::{Result, XaiError};
use ndarray::{Array2, ArrayD, ArrayView1, Axis, IxDyn};

/// Infer whether a batched numeric input is channel-first
///
/// The channel axis is assumed to be the smaller of axis 1 and the last axis. Inputs of
/// rank two (tabular) carry no channel axis and are reported as channel-first.
pub fn infer_channel_first(shape: &[usize]) -> Result<bool> {
    match shape.len() {
        0 | 1 => Err(XaiError::DataContract(format!(
            "input must be batched with at least one feature axis, got shape {:?}",
            shape
        ))),
        2 => Ok(true),
        n => {
            let first = shape[1];
            let last = shape[n - 1];
            if first < last {
                Ok(true)
            } else if first > last {
                Ok(false)
            } else {
                Err(XaiError::config(
                    "channel_first",
                    format!(
                        "cannot infer channel order of shape {:?}: axis 1 and the last axis both have size {}; pass channel_first explicitly",
                        shape, first
                    ),
                ))
            }
        }
    }
}

/// Move a channel-last batch into channel-first layout
pub fn make_channel_first(x: ArrayD<f64>, channel_first: bool) -> ArrayD<f64> {
    let n = x.ndim();
    if channel_first || n < 3 {
        return x;
    }
    let mut axes: Vec<usize> = Vec::with_capacity(n);
    axes.push(0);
    axes.push(n - 1);
    axes.extend(1..n - 1);
    x.permuted_axes(IxDyn(&axes)).as_standard_layout().into_owned()
}

/// Move a channel-first batch into channel-last layout
pub fn make_channel_last(x: ArrayD<f64>, channel_first: bool) -> ArrayD<f64> {
    let n = x.ndim();
    if !channel_first || n < 3 {
        return x;
    }
    let mut axes: Vec<usize> = Vec::with_capacity(n);
    axes.push(0);
    axes.extend(2..n);
    axes.push(1);
    x.permuted_axes(IxDyn(&axes)).as_standard_layout().into_owned()
}

/// Split an array along its first axis into chunks of `batch_size`, keeping order
pub fn batch_array(x: &ArrayD<f64>, batch_size: usize) -> Vec<ArrayD<f64>> {
    if x.shape().is_empty() || x.shape()[0] == 0 {
        return Vec::new();
    }
    x.axis_chunks_iter(Axis(0), batch_size.max(1))
        .map(|chunk| chunk.to_owned())
        .collect()
}

/// Split a slice into chunks of `batch_size`, keeping order
pub fn batch_slice<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Index of the largest value of a row; the first index wins ties
pub fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_value || (i == 0 && v.is_nan()) {
            best = i;
            best_value = v;
        }
    }
    best
}

/// Row-wise argmax of a (batch, classes) array
pub fn argmax_rows(logits: &Array2<f64>) -> Vec<usize> {
    logits.rows().into_iter().map(argmax).collect()
}

/// Maximum that propagates NaN
pub fn propagating_max(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut out = f64::NEG_INFINITY;
    for v in values {
        if v.is_nan() {
            return f64::NAN;
        }
        if v > out {
            out = v;
        }
    }
    out
}

/// Mean that skips NaN; NaN when every value is NaN
pub fn nan_mean(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.iter().sum::<f64>() / finite.len() as f64
}

/// Area under a curve with unit spacing (trapezoidal rule)
pub fn calculate_auc(values: &[f64], dx: f64) -> f64 {
    values
        .windows(2)
        .map(|w| dx * (w[0] + w[1]) / 2.0)
        .sum()
}

/// Axes of an instance-level input that an instance-level attribution covers
///
/// The attribution shape must match a contiguous run of input axes that starts at the
/// first axis or ends at the last one.
pub fn infer_attribution_axes(a_shape: &[usize], x_shape: &[usize]) -> Result<Vec<usize>> {
    if a_shape.len() > x_shape.len() {
        return Err(XaiError::shape(x_shape, a_shape));
    }
    if a_shape.is_empty() {
        return Ok(Vec::new());
    }
    let offset = x_shape.len() - a_shape.len();
    if x_shape[offset..] == *a_shape {
        return Ok((offset..x_shape.len()).collect());
    }
    if x_shape[..a_shape.len()] == *a_shape {
        return Ok((0..a_shape.len()).collect());
    }
    Err(XaiError::DataContract(format!(
        "attribution shape {:?} is not a leading or trailing sub-shape of input shape {:?}",
        a_shape, x_shape
    )))
}

/// Sizes of the axes before, inside and after a contiguous run of indexed axes
pub fn split_indexed_shape(shape: &[usize], indexed_axes: &[usize]) -> Result<(usize, usize, usize)> {
    crate::asserts::assert_indexed_axes(shape.len(), indexed_axes)?;
    let (start, end) = match (indexed_axes.first(), indexed_axes.last()) {
        (Some(&s), Some(&e)) => (s, e + 1),
        _ => return Ok((shape.iter().product(), 1, 1)),
    };
    let pre: usize = shape[..start].iter().product();
    let mid: usize = shape[start..end].iter().product();
    let post: usize = shape[end..].iter().product();
    Ok((pre, mid, post))
}

/// Indices that sort `values` in descending order; equal values keep their original order
pub fn argsort_descending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| {
        values[j]
            .partial_cmp(&values[i])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Indices that sort `values` in ascending order; equal values keep their original order
pub fn argsort_ascending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| {
        values[i]
            .partial_cmp(&values[j])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Instance `index` of a batched array as an owned array without the batch axis
pub fn instance(x: &ArrayD<f64>, index: usize) -> ArrayD<f64> {
    x.index_axis(Axis(0), index).to_owned()
}

/// Stack equally-shaped instances along a new batch axis
pub fn stack_instances(instances: &[ArrayD<f64>]) -> Result<ArrayD<f64>> {
    let views: Vec<_> = instances.iter().map(|a| a.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn test_infer_channel_first() {
        assert!(infer_channel_first(&[4, 1, 8, 8]).unwrap());
        assert!(!infer_channel_first(&[4, 8, 8, 3]).unwrap());
        assert!(infer_channel_first(&[4, 2, 100]).unwrap());
        assert!(infer_channel_first(&[10, 5]).unwrap());
        assert!(infer_channel_first(&[4, 3, 3]).is_err());
        assert!(infer_channel_first(&[4]).is_err());
    }

    #[test]
    fn test_channel_conversion_roundtrip() {
        let x = Array::from_shape_fn(IxDyn(&[2, 4, 5, 3]), |i| (i[0] * 100 + i[1] * 10 + i[2] + i[3] * 1000) as f64);
        let first = make_channel_first(x.clone(), false);
        assert_eq!(first.shape(), &[2, 3, 4, 5]);
        assert_eq!(first[[1, 2, 3, 4]], x[[1, 3, 4, 2]]);
        let last = make_channel_last(first, true);
        assert_eq!(last, x);
    }

    #[test]
    fn test_batch_array_keeps_tail() {
        let x = Array::from_shape_fn(IxDyn(&[5, 2]), |i| i[0] as f64);
        let batches = batch_array(&x, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].shape(), &[1, 2]);
        assert_eq!(batches[2][[0, 0]], 4.0);
    }

    #[test]
    fn test_argmax_first_on_ties() {
        let logits = array![[0.1, 0.5, 0.5], [2.0, 1.0, 0.0], [1.0, 1.0, 1.0]];
        assert_eq!(argmax_rows(&logits), vec![1, 0, 0]);
    }

    #[test]
    fn test_propagating_max() {
        assert_eq!(propagating_max(vec![1.0, 3.0, 2.0]), 3.0);
        assert!(propagating_max(vec![1.0, f64::NAN, 2.0]).is_nan());
    }

    #[test]
    fn test_nan_mean() {
        assert_eq!(nan_mean(&[1.0, f64::NAN, 3.0]), 2.0);
        assert!(nan_mean(&[f64::NAN]).is_nan());
    }

    #[test]
    fn test_calculate_auc() {
        assert!((calculate_auc(&[0.0, 1.0, 2.0], 1.0) - 2.0).abs() < 1e-12);
        assert_eq!(calculate_auc(&[5.0], 1.0), 0.0);
    }

    #[test]
    fn test_infer_attribution_axes() {
        assert_eq!(infer_attribution_axes(&[8, 8], &[1, 8, 8]).unwrap(), vec![1, 2]);
        assert_eq!(infer_attribution_axes(&[1, 8, 8], &[1, 8, 8]).unwrap(), vec![0, 1, 2]);
        assert_eq!(infer_attribution_axes(&[3], &[3, 8, 8]).unwrap(), vec![0]);
        assert!(infer_attribution_axes(&[4, 4], &[1, 8, 8]).is_err());
    }

    #[test]
    fn test_split_indexed_shape() {
        assert_eq!(split_indexed_shape(&[3, 4, 5], &[1, 2]).unwrap(), (3, 20, 1));
        assert_eq!(split_indexed_shape(&[3, 4, 5], &[0]).unwrap(), (1, 3, 20));
        assert!(split_indexed_shape(&[3, 4, 5], &[0, 2]).is_err());
    }

    #[test]
    fn test_argsort() {
        let values = [0.2, 0.9, 0.1, 0.9];
        assert_eq!(argsort_descending(&values), vec![1, 3, 0, 2]);
        assert_eq!(argsort_ascending(&values), vec![2, 0, 1, 3]);
    }
}
