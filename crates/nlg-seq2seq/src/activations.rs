//! Activation functions and softmax operations.

use std::str::FromStr;

use libm::{erff, tanhf};
use ndarray::{s, Array1, Array3, Array4};
use serde::{Deserialize, Serialize};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;
const SQRT_2_OVER_PI: f32 = 0.7978845608;
const GELU_COEFF: f32 = 0.044715;

/// Feed-forward activations used by the supported seq2seq families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// BART and Marian.
    Gelu,
    #[serde(alias = "gelu_new")]
    GeluNew,
    /// Original T5.
    Relu,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" => Ok(Activation::GeluNew),
            "relu" => Ok(Activation::Relu),
            _ => Err(format!("unknown activation function: {}", s)),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Gelu
    }
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn gelu_new_scalar(x: f32) -> f32 {
    let x_cubed = x * x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_cubed);
    0.5 * x * (1.0 + tanhf(inner))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

/// Applies activation in-place to a 3D array.
pub fn apply_activation(arr: &mut Array3<f32>, activation: Activation) {
    let f: fn(f32) -> f32 = match activation {
        Activation::Gelu => gelu_scalar,
        Activation::GeluNew => gelu_new_scalar,
        Activation::Relu => relu_scalar,
    };
    if arr.len() >= PARALLEL_THRESHOLD {
        arr.par_mapv_inplace(f);
    } else {
        arr.mapv_inplace(f);
    }
}

/// Applies softmax in-place to a slice.
///
/// A slice whose entries are all `-inf` is left as zeros rather than NaN.
pub fn softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        slice.iter_mut().for_each(|v| *v = 0.0);
        return;
    }

    let mut sum = 0.0;
    for v in slice.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in slice.iter_mut() {
            *v *= scale;
        }
    }
}

/// Applies softmax in-place to a 1D array.
pub fn softmax_1d_inplace(logits: &mut Array1<f32>) {
    if let Some(slice) = logits.as_slice_mut() {
        softmax_inplace(slice);
    } else {
        let mut owned = logits.to_vec();
        softmax_inplace(&mut owned);
        logits.assign(&Array1::from_vec(owned));
    }
}

/// Applies softmax along the last axis of a 4D array.
pub fn softmax_4d_inplace(scores: &mut Array4<f32>) {
    let (batch_size, num_heads, q_len, _) = scores.dim();

    for b in 0..batch_size {
        for h in 0..num_heads {
            for q in 0..q_len {
                let mut row_view = scores.slice_mut(s![b, h, q, ..]);
                if let Some(slice) = row_view.as_slice_mut() {
                    softmax_inplace(slice);
                } else {
                    let mut owned = row_view.to_vec();
                    softmax_inplace(&mut owned);
                    row_view.assign(&Array1::from_vec(owned));
                }
            }
        }
    }
}
