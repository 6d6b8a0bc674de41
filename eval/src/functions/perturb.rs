// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Perturbation strategies
//!
//! Numeric strategies perturb one instance (no batch axis). `indices` are flat positions
//! over the `indexed_axes`, which must be a consecutive run of axes touching the first or
//! the last axis; every position is perturbed across all remaining axes. Strategy
//! parameters are captured when the strategy is built.

use crate::utils::split_indexed_shape;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

/// Numeric perturbation: `(instance, indices, indexed_axes, rng) -> perturbed instance`
pub type PerturbFn =
    Arc<dyn Fn(&ArrayD<f64>, &[usize], &[usize], &mut ChaCha8Rng) -> anyhow::Result<ArrayD<f64>> + Send + Sync>;

/// Plain-text perturbation of a whole batch of strings
pub type TextPerturbFn = Arc<dyn Fn(&[String], &mut ChaCha8Rng) -> anyhow::Result<Vec<String>> + Send + Sync>;

/// How generated noise is combined with the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoiseType {
    #[default]
    Additive,
    Multiplicative,
}

impl NoiseType {
    fn apply(&self, value: f64, noise: f64) -> f64 {
        match self {
            NoiseType::Additive => value + noise,
            NoiseType::Multiplicative => value * noise,
        }
    }
}

/// Value written into removed positions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Baseline {
    Black,
    White,
    /// Mean of the instance
    Mean,
    /// Uniform draw in [0, 1) per position
    Uniform,
    Value(f64),
}

/// Visit every (pre, position, post) element of the indexed positions
fn for_each_indexed(
    arr: &mut ArrayD<f64>,
    indices: &[usize],
    indexed_axes: &[usize],
    mut f: impl FnMut(&mut f64),
) -> anyhow::Result<()> {
    let shape = arr.shape().to_vec();
    let (pre, mid, post) = split_indexed_shape(&shape, indexed_axes)?;
    if let Some(&bad) = indices.iter().find(|&&i| i >= mid) {
        anyhow::bail!("perturbation index {} is out of range for {} indexed positions", bad, mid);
    }
    let mut flat = arr.as_standard_layout().into_owned();
    {
        let data = flat
            .as_slice_mut()
            .ok_or_else(|| anyhow::anyhow!("array is not contiguous"))?;
        for p in 0..pre {
            for &m in indices {
                for q in 0..post {
                    f(&mut data[(p * mid + m) * post + q]);
                }
            }
        }
    }
    *arr = flat;
    Ok(())
}

/// Gaussian noise on the indexed positions
pub fn gaussian_noise(mean: f64, std: f64, noise_type: NoiseType) -> PerturbFn {
    Arc::new(move |arr: &ArrayD<f64>, indices: &[usize], indexed_axes: &[usize], rng: &mut ChaCha8Rng| {
        let normal = Normal::new(mean, std)?;
        let mut out = arr.clone();
        for_each_indexed(&mut out, indices, indexed_axes, |v| {
            *v = noise_type.apply(*v, normal.sample(rng));
        })?;
        Ok(out)
    })
}

/// Uniform noise on the indexed positions
///
/// Without an upper bound the noise is drawn from `[-lower_bound, lower_bound)`, otherwise
/// from `[lower_bound, upper_bound)`.
pub fn uniform_noise(lower_bound: f64, upper_bound: Option<f64>, noise_type: NoiseType) -> PerturbFn {
    Arc::new(move |arr: &ArrayD<f64>, indices: &[usize], indexed_axes: &[usize], rng: &mut ChaCha8Rng| {
        let (low, high) = match upper_bound {
            Some(upper) => (lower_bound, upper),
            None => (-lower_bound, lower_bound),
        };
        if !(low < high) {
            anyhow::bail!("uniform noise needs lower bound < upper bound, got [{}, {})", low, high);
        }
        let mut out = arr.clone();
        for_each_indexed(&mut out, indices, indexed_axes, |v| {
            *v = noise_type.apply(*v, rng.gen_range(low..high));
        })?;
        Ok(out)
    })
}

/// Replace the indexed positions with a baseline value
pub fn baseline_replacement_by_indices(baseline: Baseline) -> PerturbFn {
    Arc::new(move |arr: &ArrayD<f64>, indices: &[usize], indexed_axes: &[usize], rng: &mut ChaCha8Rng| {
        let mean = arr.mean().unwrap_or(0.0);
        let mut out = arr.clone();
        for_each_indexed(&mut out, indices, indexed_axes, |v| {
            *v = match baseline {
                Baseline::Black => 0.0,
                Baseline::White => 1.0,
                Baseline::Mean => mean,
                Baseline::Uniform => rng.gen::<f64>(),
                Baseline::Value(value) => value,
            };
        })?;
        Ok(out)
    })
}

const MAX_SWEEPS: usize = 500;
const TOLERANCE: f64 = 1e-9;

/// Neighbour offsets on a grid of rank `d`, with weight 2 for direct and 1 for diagonal neighbours
fn neighbour_offsets(d: usize) -> Vec<(Vec<isize>, f64)> {
    let mut out = Vec::new();
    let total = 3usize.pow(d as u32);
    for code in 0..total {
        let mut rest = code;
        let mut offset = Vec::with_capacity(d);
        for _ in 0..d {
            offset.push((rest % 3) as isize - 1);
            rest /= 3;
        }
        let nonzero = offset.iter().filter(|&&o| o != 0).count();
        if nonzero == 0 {
            continue;
        }
        out.push((offset, if nonzero == 1 { 2.0 } else { 1.0 }));
    }
    out
}

/// Remove the indexed positions by linear imputation from their neighbours, then add noise
///
/// Each removed value is set to the weighted mean of its neighbours on the indexed grid,
/// which yields a linear system over all removed positions. It is solved per slice of
/// the non-indexed axes with Gauss-Seidel sweeps. Gaussian noise with standard deviation
/// `noise` is added to the imputed values.
pub fn noisy_linear_imputation(noise: f64) -> PerturbFn {
    Arc::new(move |arr: &ArrayD<f64>, indices: &[usize], indexed_axes: &[usize], rng: &mut ChaCha8Rng| {
        let shape = arr.shape().to_vec();
        let (pre, mid, post) = split_indexed_shape(&shape, indexed_axes)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= mid) {
            anyhow::bail!("perturbation index {} is out of range for {} indexed positions", bad, mid);
        }
        let grid: Vec<usize> = indexed_axes.iter().map(|&a| shape[a]).collect();
        let offsets = neighbour_offsets(grid.len());

        let neighbours: Vec<Vec<(usize, f64)>> = (0..mid)
            .map(|m| {
                let coords = unravel(m, &grid);
                offsets
                    .iter()
                    .filter_map(|(offset, w)| {
                        let mut flat = 0usize;
                        for ((&c, &o), &size) in coords.iter().zip(offset).zip(&grid) {
                            let n = c as isize + o;
                            if n < 0 || n >= size as isize {
                                return None;
                            }
                            flat = flat * size + n as usize;
                        }
                        Some((flat, *w))
                    })
                    .collect()
            })
            .collect();

        let mut removed = vec![false; mid];
        for &i in indices {
            removed[i] = true;
        }
        let normal = Normal::new(0.0, noise)?;
        let mut out = arr.as_standard_layout().into_owned();
        let data = out
            .as_slice_mut()
            .ok_or_else(|| anyhow::anyhow!("array is not contiguous"))?;

        for p in 0..pre {
            for q in 0..post {
                let at = |m: usize| (p * mid + m) * post + q;
                let known: Vec<f64> = (0..mid).filter(|&m| !removed[m]).map(|m| data[at(m)]).collect();
                let fill = if known.is_empty() { 0.0 } else { known.iter().sum::<f64>() / known.len() as f64 };
                for &m in indices {
                    data[at(m)] = fill;
                }
                for _ in 0..MAX_SWEEPS {
                    let mut delta = 0.0_f64;
                    for &m in indices {
                        let (sum, weight) = neighbours[m]
                            .iter()
                            .fold((0.0, 0.0), |(s, w), &(n, nw)| (s + nw * data[at(n)], w + nw));
                        if weight > 0.0 {
                            let value = sum / weight;
                            delta = delta.max((value - data[at(m)]).abs());
                            data[at(m)] = value;
                        }
                    }
                    if delta < TOLERANCE {
                        break;
                    }
                }
                for &m in indices {
                    data[at(m)] += normal.sample(rng);
                }
            }
        }
        Ok(out.into_shape(IxDyn(&shape))?)
    })
}

fn unravel(mut flat: usize, grid: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; grid.len()];
    for (c, &size) in coords.iter_mut().zip(grid).rev() {
        *c = flat % size;
        flat /= size;
    }
    coords
}

const KEYBOARD_ROWS: [&str; 3] = ["qwertyuiop", "asdfghjkl", "zxcvbnm"];

fn keyboard_neighbour(c: char, rng: &mut ChaCha8Rng) -> char {
    let lower = c.to_ascii_lowercase();
    for row in KEYBOARD_ROWS {
        if let Some(pos) = row.find(lower) {
            let bytes = row.as_bytes();
            let mut candidates = Vec::with_capacity(2);
            if pos > 0 {
                candidates.push(bytes[pos - 1] as char);
            }
            if pos + 1 < bytes.len() {
                candidates.push(bytes[pos + 1] as char);
            }
            return candidates[rng.gen_range(0..candidates.len())];
        }
    }
    c
}

/// Replace `k` letters per string with a neighbouring key
pub fn typo_replacement(k: usize) -> TextPerturbFn {
    Arc::new(move |texts: &[String], rng: &mut ChaCha8Rng| {
        Ok(texts
            .iter()
            .map(|text| {
                let mut chars: Vec<char> = text.chars().collect();
                let letters: Vec<usize> = chars
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.is_ascii_alphabetic())
                    .map(|(i, _)| i)
                    .collect();
                if letters.is_empty() {
                    return text.clone();
                }
                for _ in 0..k {
                    let at = letters[rng.gen_range(0..letters.len())];
                    chars[at] = keyboard_neighbour(chars[at], rng);
                }
                chars.into_iter().collect()
            })
            .collect())
    })
}

/// Drop `k` words per string; strings are never emptied completely
pub fn word_dropout(k: usize) -> TextPerturbFn {
    Arc::new(move |texts: &[String], rng: &mut ChaCha8Rng| {
        Ok(texts
            .iter()
            .map(|text| {
                let mut words: Vec<&str> = text.split_whitespace().collect();
                for _ in 0..k {
                    if words.len() <= 1 {
                        break;
                    }
                    let at = rng.gen_range(0..words.len());
                    words.remove(at);
                }
                words.join(" ")
            })
            .collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::SeedableRng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    #[test]
    fn test_baseline_replacement_across_channels() {
        let x = Array::from_elem(IxDyn(&[2, 3, 3]), 5.0);
        let f = baseline_replacement_by_indices(Baseline::Black);
        let out = f(&x, &[0, 4], &[1, 2], &mut rng()).unwrap();
        for c in 0..2 {
            assert_eq!(out[[c, 0, 0]], 0.0);
            assert_eq!(out[[c, 1, 1]], 0.0);
            assert_eq!(out[[c, 2, 2]], 5.0);
        }
    }

    #[test]
    fn test_uniform_noise_bounds() {
        let x = Array::zeros(IxDyn(&[10]));
        let all: Vec<usize> = (0..10).collect();
        let out = uniform_noise(0.02, Some(0.2), NoiseType::Additive)(&x, &all, &[0], &mut rng()).unwrap();
        assert!(out.iter().all(|&v| (0.02..0.2).contains(&v)));
        let symmetric = uniform_noise(0.5, None, NoiseType::Additive)(&x, &all, &[0], &mut rng()).unwrap();
        assert!(symmetric.iter().all(|&v| (-0.5..0.5).contains(&v)));
    }

    #[test]
    fn test_gaussian_noise_reproducible() {
        let x = Array::zeros(IxDyn(&[1, 4, 4]));
        let all: Vec<usize> = (0..16).collect();
        let f = gaussian_noise(0.0, 0.1, NoiseType::Additive);
        let a = f(&x, &all, &[0, 1, 2], &mut rng()).unwrap();
        let b = f(&x, &all, &[0, 1, 2], &mut rng()).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_noisy_linear_imputation_on_constant_image() {
        let x = Array::from_elem(IxDyn(&[1, 5, 5]), 3.0);
        let f = noisy_linear_imputation(0.0);
        let out = f(&x, &[6, 12, 18], &[1, 2], &mut rng()).unwrap();
        for v in out.iter() {
            assert!((v - 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_noisy_linear_imputation_interpolates() {
        // left column 0, right column 4, middle removed: imputed values lie strictly between
        let x = Array::from_shape_fn(IxDyn(&[1, 3, 3]), |i| if i[2] == 2 { 4.0 } else { 0.0 });
        let out = noisy_linear_imputation(0.0)(&x, &[1, 4, 7], &[1, 2], &mut rng()).unwrap();
        for r in 0..3 {
            assert!(out[[0, r, 1]] > 0.0 && out[[0, r, 1]] < 4.0);
        }
        let noisy = noisy_linear_imputation(0.01)(&x, &[1, 4, 7], &[1, 2], &mut rng()).unwrap();
        assert_ne!(noisy, out);
    }

    #[test]
    fn test_index_out_of_range() {
        let x = Array::zeros(IxDyn(&[4]));
        assert!(baseline_replacement_by_indices(Baseline::Black)(&x, &[4], &[0], &mut rng()).is_err());
    }

    #[test]
    fn test_neighbour_offsets_2d() {
        let offsets = neighbour_offsets(2);
        assert_eq!(offsets.len(), 8);
        assert_eq!(offsets.iter().filter(|(_, w)| *w == 2.0).count(), 4);
    }

    #[test]
    fn test_text_perturbations() {
        let texts = vec!["the movie was great".to_string()];
        let typo = typo_replacement(1)(&texts, &mut rng()).unwrap();
        assert_eq!(typo[0].len(), texts[0].len());
        assert_ne!(typo, texts);
        let dropped = word_dropout(2)(&texts, &mut rng()).unwrap();
        assert_eq!(dropped[0].split_whitespace().count(), 2);
    }
}
