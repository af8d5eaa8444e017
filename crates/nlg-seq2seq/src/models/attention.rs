//! Multi-head attention on `[batch, seq, hidden]` tensors.

use anyhow::{anyhow, bail, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array2, Array3, Array4, ArrayView4, Axis, Zip};
use ndarray_rand::rand::Rng;

use crate::activations::softmax_4d_inplace;
use crate::models::layers::LinearLayer;

// Large negative value for masking (avoids NaN in softmax)
const MASK_VALUE: f32 = -1e9;

/// Batched `a @ b` over the last two axes, parallel over the batch.
pub fn matmul_4d(a: &ArrayView4<f32>, b: &ArrayView4<f32>) -> Array4<f32> {
    let (batch, heads, rows, _) = a.dim();
    let cols = b.shape()[3];
    let mut output = Array4::<f32>::zeros((batch, heads, rows, cols));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            for ((mut out_h, a_h), b_h) in out_b
                .outer_iter_mut()
                .zip(a_b.outer_iter())
                .zip(b_b.outer_iter())
            {
                general_mat_mul(1.0, &a_h, &b_h, 0.0, &mut out_h);
            }
        });

    output
}

/// Masks key positions whose `mask` entry is `0.0`. `mask` is `[batch, seq_k]`.
pub fn apply_padding_mask(scores: &mut Array4<f32>, mask: &Array2<f32>) -> Result<()> {
    let (batch, heads, seq_q, seq_k) = scores.dim();
    if mask.dim() != (batch, seq_k) {
        bail!(
            "padding mask shape {:?} does not match scores [{}, _, _, {}]",
            mask.shape(),
            batch,
            seq_k
        );
    }
    let expanded = mask.view().insert_axis(Axis(1)).insert_axis(Axis(1));
    let broadcast = expanded
        .broadcast((batch, heads, seq_q, seq_k))
        .ok_or_else(|| anyhow!("cannot broadcast padding mask to {:?}", scores.shape()))?;
    Zip::from(scores).and(&broadcast).par_for_each(|s, &m| {
        if m == 0.0 {
            *s = MASK_VALUE;
        }
    });
    Ok(())
}

/// Query `i` sits at absolute position `cache_len + i` and sees keys up to it.
pub fn apply_causal_mask(scores: &mut Array4<f32>, cache_len: usize) {
    let (_, _, seq_q, seq_k) = scores.dim();
    for i in 0..seq_q {
        let query_pos = cache_len + i;
        if query_pos + 1 < seq_k {
            scores
                .slice_mut(s![.., .., i, query_pos + 1..])
                .fill(MASK_VALUE);
        }
    }
}

/// `[batch, seq, heads * dim]` -> `[batch, heads, seq, dim]`
fn split_heads(x: &Array3<f32>, num_heads: usize) -> Result<Array4<f32>> {
    let (batch, seq, hidden) = x.dim();
    let x = x.as_standard_layout();
    Ok(x.view()
        .into_shape_with_order((batch, seq, num_heads, hidden / num_heads))?
        .permuted_axes([0, 2, 1, 3])
        .to_owned())
}

/// `[batch, heads, seq, dim]` -> `[batch, seq, heads * dim]`
fn merge_heads(x: Array4<f32>) -> Result<Array3<f32>> {
    let (batch, heads, seq, dim) = x.dim();
    Ok(x.permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .into_shape_with_order((batch, seq, heads * dim))?
        .to_owned())
}

/// Projections and score computation shared by self- and cross-attention.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    o_proj: LinearLayer,
    num_heads: usize,
    scale_factor: f32,
}

impl Attention {
    pub fn new(
        num_heads: usize,
        q_proj: LinearLayer,
        k_proj: LinearLayer,
        v_proj: LinearLayer,
        o_proj: LinearLayer,
    ) -> Self {
        let head_dim = q_proj.out_features() / num_heads;
        Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            scale_factor: 1.0 / (head_dim as f32).sqrt(),
        }
    }

    pub fn random<R: Rng + ?Sized>(hidden_size: usize, num_heads: usize, rng: &mut R) -> Self {
        Self::new(
            num_heads,
            LinearLayer::random(hidden_size, hidden_size, rng),
            LinearLayer::random(hidden_size, hidden_size, rng),
            LinearLayer::random(hidden_size, hidden_size, rng),
            LinearLayer::random(hidden_size, hidden_size, rng),
        )
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Keys and values of `hidden`, kept in `[batch, seq, hidden]` for caching.
    pub fn project_kv(&self, hidden: &Array3<f32>) -> Result<(Array3<f32>, Array3<f32>)> {
        Ok((self.k_proj.forward_3d(hidden)?, self.v_proj.forward_3d(hidden)?))
    }

    /// Attends from `hidden` to `key`/`value`.
    ///
    /// `causal_offset` enables the causal mask, with the first query at that
    /// absolute position. Returns the projected output and the attention
    /// weights `[batch, heads, seq_q, seq_k]`.
    pub fn attend(
        &self,
        hidden: &Array3<f32>,
        key: &Array3<f32>,
        value: &Array3<f32>,
        padding_mask: Option<&Array2<f32>>,
        causal_offset: Option<usize>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        let q_heads = split_heads(&self.q_proj.forward_3d(hidden)?, self.num_heads)?;
        let k_heads = split_heads(key, self.num_heads)?;
        let v_heads = split_heads(value, self.num_heads)?;

        let k_t = k_heads.view().permuted_axes([0, 1, 3, 2]);
        let mut scores = matmul_4d(&q_heads.view(), &k_t);
        scores.mapv_inplace(|x| x * self.scale_factor);

        if let Some(mask) = padding_mask {
            apply_padding_mask(&mut scores, mask)?;
        }
        if let Some(cache_len) = causal_offset {
            apply_causal_mask(&mut scores, cache_len);
        }

        softmax_4d_inplace(&mut scores);

        let context = matmul_4d(&scores.view(), &v_heads.view());
        let output = self.o_proj.forward_3d(&merge_heads(context)?)?;
        Ok((output, scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{concatenate, Array, ArrayView2};
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn random_hidden(rng: &mut StdRng, batch: usize, seq: usize, hidden: usize) -> Array3<f32> {
        Array::random_using((batch, seq, hidden), Uniform::new(-1.0, 1.0), rng)
    }

    #[test]
    fn test_matmul_4d_matches_2d_dot() {
        let a = Array4::from_shape_fn((2, 3, 4, 5), |(b, h, i, j)| (b + h + i * j) as f32 * 0.1);
        let b = Array4::from_shape_fn((2, 3, 5, 2), |(b, h, i, j)| (b * h + i + j) as f32 * 0.2);
        let out = matmul_4d(&a.view(), &b.view());
        let a_h: ArrayView2<f32> = a.slice(s![1, 2, .., ..]);
        let b_h: ArrayView2<f32> = b.slice(s![1, 2, .., ..]);
        let expected: Array2<f32> = a_h.dot(&b_h);
        for ((i, j), &e) in expected.indexed_iter() {
            assert_abs_diff_eq!(out[[1, 2, i, j]], e, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_causal_mask() {
        let mut scores = Array4::zeros((1, 1, 3, 3));
        apply_causal_mask(&mut scores, 0);
        assert_eq!(scores[[0, 0, 0, 1]], MASK_VALUE);
        assert_eq!(scores[[0, 0, 1, 1]], 0.0);
        assert_eq!(scores[[0, 0, 1, 2]], MASK_VALUE);

        // A single query after two cached positions sees everything.
        let mut scores = Array4::zeros((1, 1, 1, 3));
        apply_causal_mask(&mut scores, 2);
        assert!(scores.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_padding_mask_shape_mismatch_is_error() {
        let mut scores = Array4::zeros((2, 1, 1, 3));
        assert!(apply_padding_mask(&mut scores, &Array2::ones((2, 4))).is_err());
        assert!(apply_padding_mask(&mut scores, &Array2::ones((1, 3))).is_err());
        assert!(scores.iter().all(|&s| s == 0.0));

        let mut rng = StdRng::seed_from_u64(5);
        let attn = Attention::random(8, 2, &mut rng);
        let hidden = random_hidden(&mut rng, 2, 1, 8);
        let (k, v) = attn.project_kv(&random_hidden(&mut rng, 2, 3, 8)).unwrap();
        assert!(attn.attend(&hidden, &k, &v, Some(&Array2::ones((2, 2))), None).is_err());
    }

    #[test]
    fn test_padding_mask_zeroes_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let attn = Attention::random(8, 2, &mut rng);
        let hidden = random_hidden(&mut rng, 2, 1, 8);
        let memory = random_hidden(&mut rng, 2, 4, 8);
        let (k, v) = attn.project_kv(&memory).unwrap();
        let mask = ndarray::array![[1.0, 1.0, 1.0, 0.0], [1.0, 1.0, 1.0, 1.0]];

        let (_, weights) = attn.attend(&hidden, &k, &v, Some(&mask), None).unwrap();
        assert_eq!(weights.shape(), &[2, 2, 1, 4]);
        assert!(weights.slice(s![0, .., .., 3]).iter().all(|&w| w == 0.0));
        assert!(weights.slice(s![1, .., .., 3]).iter().all(|&w| w > 0.0));
        for row in weights.lanes(Axis(3)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_incremental_matches_full_causal() {
        let mut rng = StdRng::seed_from_u64(4);
        let attn = Attention::random(8, 2, &mut rng);
        let hidden = random_hidden(&mut rng, 1, 4, 8);

        let (k, v) = attn.project_kv(&hidden).unwrap();
        let (full, _) = attn.attend(&hidden, &k, &v, None, Some(0)).unwrap();

        // Feed the last position alone against the accumulated keys.
        let last = hidden.slice(s![.., 3..4, ..]).to_owned();
        let (k_last, v_last) = attn.project_kv(&last).unwrap();
        let k_all = concatenate(Axis(1), &[k.slice(s![.., ..3, ..]), k_last.view()]).unwrap();
        let v_all = concatenate(Axis(1), &[v.slice(s![.., ..3, ..]), v_last.view()]).unwrap();
        let (step, _) = attn.attend(&last, &k_all, &v_all, None, Some(3)).unwrap();

        for j in 0..8 {
            assert_abs_diff_eq!(step[[0, 0, j]], full[[0, 3, j]], epsilon = 1e-5);
        }
    }
}
