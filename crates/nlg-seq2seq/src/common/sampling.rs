use std::cmp::Ordering;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::activations::softmax_1d_inplace;
use crate::common::GenerationConfig;
use crate::error::{GenerationError, GenerationResult};

/// Index of the highest logit. Ties resolve to the lowest id.
///
/// Returns `None` when every entry is `-inf` or NaN.
pub fn argmax(logits: &ArrayView1<f32>) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &x) in logits.iter().enumerate() {
        if x.is_nan() || x == f32::NEG_INFINITY {
            continue;
        }
        match best {
            Some((_, b)) if x <= b => {}
            _ => best = Some((idx, x)),
        }
    }
    best.map(|(idx, _)| idx as u32)
}

fn descending_order(logits: &Array1<f32>) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    // Stable sort keeps lower ids first among equal logits.
    indices.sort_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(Ordering::Equal)
    });
    indices
}

/// Keeps the `k` highest logits; `k == 0` or `k >= len` keeps everything.
pub fn top_k_filtering(mut logits: Array1<f32>, k: usize) -> Array1<f32> {
    if k == 0 || k >= logits.len() {
        return logits;
    }
    let indices = descending_order(&logits);
    for &idx in &indices[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
    logits
}

/// Nucleus filtering: keeps the smallest descending prefix whose probability
/// mass reaches `p`. The most likely token always survives.
pub fn top_p_filtering(mut logits: Array1<f32>, p: f32) -> Array1<f32> {
    if p >= 1.0 {
        return logits;
    }
    let indices = descending_order(&logits);

    let mut probs = logits.clone();
    softmax_1d_inplace(&mut probs);

    let mut cumulative = 0.0;
    for (i, &idx) in indices.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            for &invalid_idx in &indices[i + 1..] {
                logits[invalid_idx] = f32::NEG_INFINITY;
            }
            break;
        }
    }
    logits
}

/// Draws an index from a probability vector using inverse-CDF sampling.
///
/// Zero-probability entries are never returned.
pub fn sample_from_probs<R: Rng + ?Sized>(probs: &Array1<f32>, rng: &mut R) -> Option<u32> {
    let total: f32 = probs.sum();
    if !(total > 0.0) {
        return None;
    }
    let uniform: f32 = rng.gen::<f32>() * total;
    let mut cumulative = 0.0;
    let mut last_valid = None;
    for (idx, &prob) in probs.iter().enumerate() {
        if prob <= 0.0 {
            continue;
        }
        cumulative += prob;
        last_valid = Some(idx as u32);
        if cumulative > uniform {
            return last_valid;
        }
    }
    // Rounding left `uniform` just past the accumulated mass.
    last_valid
}

/// Picks the next token for every sequence of a batch.
///
/// Holds the RNG so that a seeded generation call is reproducible end to end.
pub struct Sampler {
    do_sample: bool,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: &GenerationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            do_sample: config.do_sample,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.do_sample
    }

    /// Selects one token from a single masked logit row.
    pub fn sample_row(&mut self, logits: ArrayView1<f32>) -> Option<u32> {
        if !self.do_sample {
            return argmax(&logits);
        }

        let mut logits = logits.to_owned();
        if self.temperature != 1.0 {
            logits /= self.temperature;
        }
        if self.top_k > 0 {
            logits = top_k_filtering(logits, self.top_k);
        }
        if self.top_p < 1.0 {
            logits = top_p_filtering(logits, self.top_p);
        }

        softmax_1d_inplace(&mut logits);
        sample_from_probs(&logits, &mut self.rng)
    }

    /// Selects the next token for each row of a `[batch, vocab]` matrix.
    ///
    /// `cur_len` is only used to report which step had no valid token.
    pub fn sample(&mut self, logits: &Array2<f32>, cur_len: usize) -> GenerationResult<Vec<u32>> {
        logits
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(batch_index, row)| {
                self.sample_row(row)
                    .ok_or(GenerationError::NoValidToken { batch_index, cur_len })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn greedy() -> Sampler {
        Sampler::new(&GenerationConfig::greedy(10))
    }

    // ============== argmax ==============

    #[test]
    fn test_argmax_basic() {
        assert_eq!(argmax(&array![1.0, 5.0, 3.0, 2.0].view()), Some(1));
    }

    #[test]
    fn test_argmax_tie_picks_lowest_id() {
        assert_eq!(argmax(&array![1.0, 5.0, 5.0].view()), Some(1));
    }

    #[test]
    fn test_argmax_skips_masked() {
        let logits = array![f32::NEG_INFINITY, -3.0, f32::NEG_INFINITY];
        assert_eq!(argmax(&logits.view()), Some(1));
        let all_masked = array![f32::NEG_INFINITY, f32::NEG_INFINITY];
        assert_eq!(argmax(&all_masked.view()), None);
    }

    // ============== top_k_filtering ==============

    #[test]
    fn test_top_k_filtering_basic() {
        let logits = array![1.0, 5.0, 3.0, 4.0, 2.0];
        let filtered = top_k_filtering(logits, 3);

        // Top 3 are indices 1 (5.0), 3 (4.0), 2 (3.0)
        assert!(filtered[1].is_finite());
        assert!(filtered[3].is_finite());
        assert!(filtered[2].is_finite());
        assert_eq!(filtered[0], f32::NEG_INFINITY);
        assert_eq!(filtered[4], f32::NEG_INFINITY);
    }

    #[test]
    fn test_top_k_filtering_zero_and_oversized_k_keep_all() {
        let logits = array![1.0, 2.0, 3.0];
        assert!(top_k_filtering(logits.clone(), 0).iter().all(|x| x.is_finite()));
        assert!(top_k_filtering(logits, 10).iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_top_k_filtering_k_is_one() {
        let filtered = top_k_filtering(array![1.0, 5.0, 3.0], 1);
        assert!(filtered[1].is_finite());
        assert_eq!(filtered[0], f32::NEG_INFINITY);
        assert_eq!(filtered[2], f32::NEG_INFINITY);
    }

    // ============== top_p_filtering ==============

    #[test]
    fn test_top_p_filtering_keeps_smallest_covering_prefix() {
        // softmax([ln 0.5, ln 0.3, ln 0.2]) == [0.5, 0.3, 0.2]
        let logits = array![0.5f32.ln(), 0.3f32.ln(), 0.2f32.ln()];
        let filtered = top_p_filtering(logits, 0.75);
        assert!(filtered[0].is_finite());
        assert!(filtered[1].is_finite());
        assert_eq!(filtered[2], f32::NEG_INFINITY);
    }

    #[test]
    fn test_top_p_filtering_p_is_one() {
        let filtered = top_p_filtering(array![1.0, 2.0, 3.0, 4.0], 1.0);
        assert!(filtered.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_top_p_filtering_very_small_p_keeps_one() {
        let filtered = top_p_filtering(array![1.0, 2.0, 10.0], 0.01);
        assert!(filtered[2].is_finite());
        assert_eq!(filtered.iter().filter(|x| x.is_finite()).count(), 1);
    }

    // ============== sample_from_probs ==============

    #[test]
    fn test_sample_from_probs_deterministic() {
        let probs = array![0.0, 0.0, 1.0, 0.0];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..10 {
            assert_eq!(sample_from_probs(&probs, &mut rng), Some(2));
        }
    }

    #[test]
    fn test_sample_from_probs_never_returns_zero_mass() {
        let probs = array![0.5, 0.0, 0.5, 0.0];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let idx = sample_from_probs(&probs, &mut rng).unwrap();
            assert!(idx == 0 || idx == 2);
        }
    }

    #[test]
    fn test_sample_from_probs_all_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_from_probs(&array![0.0, 0.0], &mut rng), None);
    }

    // ============== Sampler ==============

    #[test]
    fn test_greedy_sampler_batch() {
        let logits = array![[0.1, 0.9, 0.0], [3.0, 1.0, 2.0]];
        assert_eq!(greedy().sample(&logits, 4).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_all_masked_row_is_an_error() {
        let logits = array![[0.1, 0.9], [f32::NEG_INFINITY, f32::NEG_INFINITY]];
        let err = greedy().sample(&logits, 7).unwrap_err();
        assert!(matches!(
            err,
            GenerationError::NoValidToken { batch_index: 1, cur_len: 7 }
        ));

        let mut sampler = Sampler::new(&GenerationConfig::sampling(10, 1.0).with_seed(0));
        assert!(sampler.sample(&logits, 7).is_err());
    }

    #[test]
    fn test_top_k_one_with_low_temperature_is_greedy() {
        let config = GenerationConfig::sampling(10, 0.1).with_top_k(1).with_seed(9);
        let mut sampler = Sampler::new(&config);
        let logits = array![[1.0, 2.0, 10.0, 0.5, 0.1]];
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits, 1).unwrap(), vec![2]);
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let config = GenerationConfig::sampling(10, 1.0).with_seed(42);
        let logits = Array2::from_shape_fn((3, 16), |(b, v)| ((b * 7 + v * 3) % 5) as f32 * 0.3);

        let draw = |mut sampler: Sampler| -> Vec<u32> {
            (0..20)
                .flat_map(|_| sampler.sample(&logits, 1).unwrap())
                .collect()
        };
        assert_eq!(draw(Sampler::new(&config)), draw(Sampler::new(&config)));
    }

    #[test]
    fn test_sampling_respects_masked_tokens() {
        let config = GenerationConfig::sampling(10, 1.5).with_seed(3);
        let mut sampler = Sampler::new(&config);
        let logits = array![[f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY, 0.0]];
        for _ in 0..100 {
            let token = sampler.sample(&logits, 1).unwrap()[0];
            assert!(token == 1 || token == 3);
        }
    }
}
