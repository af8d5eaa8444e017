//! Dense building blocks of the reference model.

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::activations::{apply_activation, Activation};

/// `y = x W^T + b` with `W` stored as `[out_features, in_features]`.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self {
            weight,
            bias: bias.into(),
        }
    }

    /// Uniform init in `±1/sqrt(in_features)`, zero bias.
    pub fn random<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = Array2::random_using((out_features, in_features), Uniform::new(-bound, bound), rng);
        Self::new(weight, Array1::zeros(out_features))
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut output = input.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            output += bias;
        }
        output
    }

    /// Applies the layer to every position of a `[batch, seq, in]` tensor.
    pub fn forward_3d(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq, hidden) = input.dim();
        let input = input.as_standard_layout();
        let input_2d = input.view().into_shape_with_order((batch * seq, hidden))?;
        let output = self.matmul(&input_2d);
        Ok(output.into_shape_with_order((batch, seq, self.out_features()))?)
    }
}

/// Layer normalization over the hidden axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// Unit scale, zero shift.
    pub fn identity(hidden_size: usize, eps: f32) -> Self {
        Self::new(Array1::ones(hidden_size), Array1::zeros(hidden_size), eps)
    }

    pub fn forward(&self, hidden_states: &ArrayView3<f32>) -> Array3<f32> {
        let (batch, seq, _) = hidden_states.dim();
        // Zero-width hidden axis.
        let Some(mean) = hidden_states.mean_axis(Axis(2)) else {
            return Array3::zeros((batch, seq, self.weight.len()));
        };
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let var_expanded = variance.insert_axis(Axis(2));

        let inv_std = (&var_expanded + self.eps).mapv(|x| 1.0 / x.sqrt());
        let normalized = (hidden_states - &mean_expanded) * &inv_std;

        normalized * &self.weight + &self.bias
    }

    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        self.forward(&hidden.view())
    }
}

/// Sine/cosine position table of shape `[max_len, dim]`.
pub fn create_sinusoidal_embeddings(max_len: usize, dim: usize) -> Array2<f32> {
    let mut embeddings = Array2::<f32>::zeros((max_len, dim));

    for pos in 0..max_len {
        for i in 0..dim / 2 {
            let angle = pos as f32 / 10000_f32.powf(2.0 * i as f32 / dim as f32);
            embeddings[[pos, 2 * i]] = angle.sin();
            embeddings[[pos, 2 * i + 1]] = angle.cos();
        }
    }

    embeddings
}

/// Token lookup plus optional absolute positions.
#[derive(Debug, Clone)]
pub struct Embeddings {
    word_embeddings: Array2<f32>,
    position_embeddings: Option<Array2<f32>>,
    embed_scale: f32,
}

impl Embeddings {
    pub fn new(
        word_embeddings: Array2<f32>,
        position_embeddings: Option<Array2<f32>>,
        scale_embeddings: bool,
    ) -> Self {
        let hidden_size = word_embeddings.shape()[1];
        let embed_scale = if scale_embeddings {
            (hidden_size as f32).sqrt()
        } else {
            1.0
        };
        Self {
            word_embeddings,
            position_embeddings,
            embed_scale,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.word_embeddings.shape()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.word_embeddings.shape()[1]
    }

    /// The word table, shared with the LM head.
    pub fn word_embeddings(&self) -> &Array2<f32> {
        &self.word_embeddings
    }

    /// Embeds `input_ids` whose first column sits at `position_offset`.
    pub fn forward(&self, input_ids: &Array2<u32>, position_offset: usize) -> Result<Array3<f32>> {
        let hidden = self.embed_words(input_ids)?;
        self.add_positions(hidden, position_offset)
    }

    /// Scaled token lookup without positions.
    pub fn embed_words(&self, input_ids: &Array2<u32>) -> Result<Array3<f32>> {
        let (batch_size, seq_len) = input_ids.dim();
        let vocab_size = self.vocab_size();

        let mut hidden = Array3::<f32>::zeros((batch_size, seq_len, self.hidden_size()));
        for ((b, t), &token) in input_ids.indexed_iter() {
            if token as usize >= vocab_size {
                bail!("token id {} out of range for vocab size {}", token, vocab_size);
            }
            hidden
                .slice_mut(s![b, t, ..])
                .assign(&self.word_embeddings.row(token as usize));
        }

        if self.embed_scale != 1.0 {
            hidden.mapv_inplace(|x| x * self.embed_scale);
        }
        Ok(hidden)
    }

    /// Adds the position table to already embedded inputs.
    pub fn add_positions(&self, mut hidden: Array3<f32>, position_offset: usize) -> Result<Array3<f32>> {
        let Some(pos_emb) = &self.position_embeddings else {
            return Ok(hidden);
        };
        let seq_len = hidden.shape()[1];
        let end = position_offset + seq_len;
        if end > pos_emb.shape()[0] {
            bail!(
                "position {} exceeds max_position_embeddings ({})",
                end - 1,
                pos_emb.shape()[0]
            );
        }
        let pos_slice = pos_emb.slice(s![position_offset..end, ..]).insert_axis(Axis(0));
        hidden += &pos_slice;
        Ok(hidden)
    }
}

/// Two-layer position-wise MLP.
#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: LinearLayer,
    fc2: LinearLayer,
    activation: Activation,
}

impl FeedForward {
    pub fn new(fc1: LinearLayer, fc2: LinearLayer, activation: Activation) -> Self {
        Self { fc1, fc2, activation }
    }

    pub fn forward(&self, hidden: &Array3<f32>) -> Result<Array3<f32>> {
        let mut intermediate = self.fc1.forward_3d(hidden)?;
        apply_activation(&mut intermediate, self.activation);
        self.fc2.forward_3d(&intermediate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, array};
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;

    #[test]
    fn test_linear_matmul_with_bias() {
        let layer = LinearLayer::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]), Some(arr1(&[10.0, 20.0])));
        let output = layer.matmul(&arr2(&[[1.0, 1.0]]).view());
        assert_eq!(output, arr2(&[[13.0, 27.0]]));
    }

    #[test]
    fn test_linear_forward_3d_matches_rows() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = LinearLayer::random(4, 3, &mut rng);
        let input = Array3::from_shape_fn((2, 5, 4), |(b, t, h)| (b * 20 + t * 4 + h) as f32 * 0.1);
        let output = layer.forward_3d(&input).unwrap();
        assert_eq!(output.shape(), &[2, 5, 3]);

        let row = layer.matmul(&input.slice(s![1, 2..3, ..]));
        for j in 0..3 {
            assert_abs_diff_eq!(output[[1, 2, j]], row[[0, j]], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_variance() {
        let norm = LayerNorm::identity(4, 1e-6);
        let input = Array3::from_shape_vec((1, 2, 4), vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0]).unwrap();
        let output = norm.forward_3d(&input);
        for row in output.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-5);
            assert_abs_diff_eq!(row.mapv(|x| x * x).mean().unwrap(), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_sinusoidal_first_position() {
        let table = create_sinusoidal_embeddings(3, 4);
        assert_eq!(table.row(0).to_vec(), vec![0.0, 1.0, 0.0, 1.0]);
        assert_abs_diff_eq!(table[[1, 0]], 1.0f32.sin(), epsilon = 1e-6);
    }

    #[test]
    fn test_embeddings_lookup_scale_and_offset() {
        let words = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let positions = array![[0.0, 0.0], [10.0, 10.0], [20.0, 20.0]];
        let embeddings = Embeddings::new(words, Some(positions), false);

        let hidden = embeddings.forward(&array![[2, 0]], 1).unwrap();
        assert_eq!(hidden.slice(s![0, 0, ..]).to_vec(), vec![11.0, 11.0]);
        assert_eq!(hidden.slice(s![0, 1, ..]).to_vec(), vec![21.0, 20.0]);
    }

    #[test]
    fn test_embeddings_errors() {
        let embeddings = Embeddings::new(Array2::zeros((3, 2)), Some(Array2::zeros((2, 2))), true);
        assert!(embeddings.forward(&array![[3]], 0).is_err());
        assert!(embeddings.forward(&array![[0, 1, 2]], 0).is_err());
        assert!(embeddings.forward(&array![[0, 1]], 0).is_ok());
    }

    #[test]
    fn test_feed_forward_shape() {
        let mut rng = StdRng::seed_from_u64(2);
        let ffn = FeedForward::new(
            LinearLayer::random(8, 16, &mut rng),
            LinearLayer::random(16, 8, &mut rng),
            Activation::Relu,
        );
        let output = ffn.forward(&Array3::ones((2, 3, 8))).unwrap();
        assert_eq!(output.shape(), &[2, 3, 8]);
    }
}
