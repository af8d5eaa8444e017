use anyhow::{anyhow, bail, Result};
use ndarray::{s, Array2, Array3, Array4, Axis};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::cache::{DecoderCache, KeyValue};
use crate::generation::{EncoderInput, EncoderOutput, ModelFamily, Seq2SeqModel, SpecialTokens, StepOutput};
use crate::models::attention::Attention;
use crate::models::config::{PositionEncoding, ReferenceConfig};
use crate::models::layers::{create_sinusoidal_embeddings, Embeddings, FeedForward, LayerNorm, LinearLayer};

/// Wraps a sub-layer with its residual connection and layer norm, pre- or post-norm.
fn residual<F>(hidden: &Array3<f32>, norm: &LayerNorm, normalize_before: bool, sublayer: F) -> Result<Array3<f32>>
where
    F: FnOnce(&Array3<f32>) -> Result<Array3<f32>>,
{
    if normalize_before {
        let out = sublayer(&norm.forward_3d(hidden))?;
        Ok(hidden + &out)
    } else {
        let out = sublayer(hidden)?;
        Ok(norm.forward_3d(&(hidden + &out)))
    }
}

fn random_ffn<R: Rng + ?Sized>(config: &ReferenceConfig, rng: &mut R) -> FeedForward {
    FeedForward::new(
        LinearLayer::random(config.hidden_size, config.ffn_dim, rng),
        LinearLayer::random(config.ffn_dim, config.hidden_size, rng),
        config.activation,
    )
}

struct EncoderLayer {
    self_attn: Attention,
    self_attn_norm: LayerNorm,
    ffn: FeedForward,
    ffn_norm: LayerNorm,
    normalize_before: bool,
}

impl EncoderLayer {
    fn random<R: Rng + ?Sized>(config: &ReferenceConfig, rng: &mut R) -> Self {
        Self {
            self_attn: Attention::random(config.hidden_size, config.num_heads, rng),
            self_attn_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            ffn: random_ffn(config, rng),
            ffn_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            normalize_before: config.normalize_before,
        }
    }

    fn forward(&self, hidden: &Array3<f32>, mask: Option<&Array2<f32>>) -> Result<Array3<f32>> {
        let hidden = residual(hidden, &self.self_attn_norm, self.normalize_before, |h| {
            let (k, v) = self.self_attn.project_kv(h)?;
            Ok(self.self_attn.attend(h, &k, &v, mask, None)?.0)
        })?;
        residual(&hidden, &self.ffn_norm, self.normalize_before, |h| self.ffn.forward(h))
    }
}

struct DecoderLayerOutput {
    hidden: Array3<f32>,
    new_key: Array3<f32>,
    new_value: Array3<f32>,
    /// `[batch, heads, seq_q, src_len]`
    cross_weights: Array4<f32>,
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_norm: LayerNorm,
    cross_attn: Attention,
    cross_attn_norm: LayerNorm,
    ffn: FeedForward,
    ffn_norm: LayerNorm,
    normalize_before: bool,
}

impl DecoderLayer {
    fn random<R: Rng + ?Sized>(config: &ReferenceConfig, rng: &mut R) -> Self {
        Self {
            self_attn: Attention::random(config.hidden_size, config.num_heads, rng),
            self_attn_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            cross_attn: Attention::random(config.hidden_size, config.num_heads, rng),
            cross_attn_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            ffn: random_ffn(config, rng),
            ffn_norm: LayerNorm::identity(config.hidden_size, config.layer_norm_eps),
            normalize_before: config.normalize_before,
        }
    }

    fn forward(
        &self,
        hidden: &Array3<f32>,
        cross_kv: &KeyValue,
        encoder_mask: Option<&Array2<f32>>,
        past: Option<&KeyValue>,
    ) -> Result<DecoderLayerOutput> {
        let past_len = past.map_or(0, KeyValue::seq_len);

        let mut new_kv = None;
        let hidden = residual(hidden, &self.self_attn_norm, self.normalize_before, |h| {
            let (new_key, new_value) = self.self_attn.project_kv(h)?;
            let (key, value) = match past {
                Some(past) => (
                    ndarray::concatenate(Axis(1), &[past.key.view(), new_key.view()])?,
                    ndarray::concatenate(Axis(1), &[past.value.view(), new_value.view()])?,
                ),
                None => (new_key.clone(), new_value.clone()),
            };
            let (out, _) = self.self_attn.attend(h, &key, &value, None, Some(past_len))?;
            new_kv = Some((new_key, new_value));
            Ok(out)
        })?;

        let mut cross_weights = None;
        let hidden = residual(&hidden, &self.cross_attn_norm, self.normalize_before, |h| {
            let (out, weights) =
                self.cross_attn
                    .attend(h, &cross_kv.key, &cross_kv.value, encoder_mask, None)?;
            cross_weights = Some(weights);
            Ok(out)
        })?;

        let hidden = residual(&hidden, &self.ffn_norm, self.normalize_before, |h| self.ffn.forward(h))?;

        let (new_key, new_value) = new_kv.ok_or_else(|| anyhow!("self-attention did not run"))?;
        let cross_weights = cross_weights.ok_or_else(|| anyhow!("cross-attention did not run"))?;
        Ok(DecoderLayerOutput {
            hidden,
            new_key,
            new_value,
            cross_weights,
        })
    }
}

/// A randomly initialised encoder-decoder transformer running on ndarray.
///
/// Token embeddings are shared between encoder, decoder and LM head. Weights
/// are drawn from a `StdRng` seeded with [`ReferenceConfig::seed`], so two
/// models built from the same config are identical.
pub struct CpuSeq2SeqModel {
    config: ReferenceConfig,
    embeddings: Embeddings,
    encoder_layers: Vec<EncoderLayer>,
    encoder_final_norm: Option<LayerNorm>,
    decoder_layers: Vec<DecoderLayer>,
    decoder_final_norm: Option<LayerNorm>,
    final_logits_bias: ndarray::Array1<f32>,
}

impl CpuSeq2SeqModel {
    pub fn new(config: ReferenceConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let word_embeddings = Array2::random_using(
            (config.vocab_size, config.hidden_size),
            Uniform::new(-1.0, 1.0),
            &mut rng,
        );
        let position_embeddings = match config.position_encoding {
            PositionEncoding::Learned => Some(Array2::random_using(
                (config.max_position_embeddings, config.hidden_size),
                Uniform::new(-0.1, 0.1),
                &mut rng,
            )),
            PositionEncoding::Sinusoidal => Some(create_sinusoidal_embeddings(
                config.max_position_embeddings,
                config.hidden_size,
            )),
            PositionEncoding::None => None,
        };
        let embeddings = Embeddings::new(word_embeddings, position_embeddings, config.scale_embedding);

        let encoder_layers = (0..config.encoder_layers)
            .map(|_| EncoderLayer::random(&config, &mut rng))
            .collect();
        let decoder_layers = (0..config.decoder_layers)
            .map(|_| DecoderLayer::random(&config, &mut rng))
            .collect();

        let final_norm = || {
            config
                .normalize_before
                .then(|| LayerNorm::identity(config.hidden_size, config.layer_norm_eps))
        };
        let final_logits_bias = ndarray::Array1::random_using(config.vocab_size, Uniform::new(-0.5, 0.5), &mut rng);

        log::debug!(
            "Built reference {} model: {} encoder / {} decoder layers, hidden {}, vocab {}",
            config.family,
            config.encoder_layers,
            config.decoder_layers,
            config.hidden_size,
            config.vocab_size
        );

        Ok(Self {
            encoder_final_norm: final_norm(),
            decoder_final_norm: final_norm(),
            config,
            embeddings,
            encoder_layers,
            decoder_layers,
            final_logits_bias,
        })
    }

    pub fn config(&self) -> &ReferenceConfig {
        &self.config
    }

    /// Embeds the token ids with the shared table, for callers that want to
    /// pass embeddings to the encoder.
    pub fn embed_tokens(&self, input_ids: &Array2<u32>) -> Result<Array3<f32>> {
        self.embeddings.embed_words(input_ids)
    }

    /// Runs the decoder stack. `past_len` is the absolute position of the
    /// first column of `decoder_input_ids`.
    fn decode(
        &self,
        decoder_input_ids: &Array2<u32>,
        encoder_output: &EncoderOutput,
        cache: Option<&mut DecoderCache>,
        past_len: usize,
    ) -> Result<(Array2<f32>, Vec<Array3<f32>>)> {
        let mut hidden = self.embeddings.forward(decoder_input_ids, past_len)?;
        let mut cross_attentions = Vec::with_capacity(self.decoder_layers.len());
        let encoder_mask = encoder_output.attention_mask.as_ref();

        match cache {
            Some(cache) => {
                for (i, layer) in self.decoder_layers.iter().enumerate() {
                    let out = {
                        let layer_cache = cache
                            .layer(i)
                            .ok_or_else(|| anyhow!("cache has no layer {}", i))?;
                        let cross_kv = layer_cache
                            .cross_attn
                            .as_ref()
                            .ok_or_else(|| anyhow!("cross-attention cache of layer {} is empty", i))?;
                        layer.forward(&hidden, cross_kv, encoder_mask, layer_cache.self_attn.as_ref())?
                    };
                    cache.append_self_attn(i, &out.new_key, &out.new_value)?;
                    cross_attentions.push(last_query(&out.cross_weights));
                    hidden = out.hidden;
                }
            }
            None => {
                for layer in &self.decoder_layers {
                    let (key, value) = layer.cross_attn.project_kv(&encoder_output.hidden_states)?;
                    let cross_kv = KeyValue::new(key, value)?;
                    let out = layer.forward(&hidden, &cross_kv, encoder_mask, None)?;
                    cross_attentions.push(last_query(&out.cross_weights));
                    hidden = out.hidden;
                }
            }
        }

        if let Some(norm) = &self.decoder_final_norm {
            hidden = norm.forward_3d(&hidden);
        }

        let seq_len = hidden.shape()[1];
        let last_hidden = hidden.slice(s![.., seq_len - 1, ..]);
        let logits = last_hidden.dot(&self.embeddings.word_embeddings().t()) + &self.final_logits_bias;

        Ok((logits, cross_attentions))
    }
}

/// Attention weights of the last query position, `[batch, heads, src_len]`.
fn last_query(weights: &Array4<f32>) -> Array3<f32> {
    let seq_q = weights.shape()[2];
    weights.slice(s![.., .., seq_q - 1, ..]).to_owned()
}

impl Seq2SeqModel for CpuSeq2SeqModel {
    fn family(&self) -> ModelFamily {
        self.config.family
    }

    fn num_layers(&self) -> usize {
        self.config.decoder_layers
    }

    fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.config.special_tokens
    }

    fn encode(&self, input: EncoderInput) -> Result<EncoderOutput> {
        let (mut hidden, attention_mask) = match input {
            EncoderInput::TokenIds {
                input_ids,
                attention_mask,
            } => (self.embeddings.forward(&input_ids, 0)?, attention_mask),
            EncoderInput::Embeddings {
                inputs_embeds,
                attention_mask,
            } => {
                if inputs_embeds.shape()[2] != self.config.hidden_size {
                    bail!(
                        "input embeddings have hidden size {}, model expects {}",
                        inputs_embeds.shape()[2],
                        self.config.hidden_size
                    );
                }
                (self.embeddings.add_positions(inputs_embeds, 0)?, attention_mask)
            }
        };

        if let Some(mask) = &attention_mask {
            if mask.dim() != (hidden.shape()[0], hidden.shape()[1]) {
                bail!(
                    "attention mask shape {:?} does not match input [{}, {}]",
                    mask.shape(),
                    hidden.shape()[0],
                    hidden.shape()[1]
                );
            }
        }

        for layer in &self.encoder_layers {
            hidden = layer.forward(&hidden, attention_mask.as_ref())?;
        }
        if let Some(norm) = &self.encoder_final_norm {
            hidden = norm.forward_3d(&hidden);
        }

        Ok(EncoderOutput {
            hidden_states: hidden,
            attention_mask,
        })
    }

    fn initial_cache(&self, encoder_output: &EncoderOutput) -> Result<DecoderCache> {
        let mut cache = DecoderCache::new(self.decoder_layers.len());
        for (i, layer) in self.decoder_layers.iter().enumerate() {
            let (key, value) = layer.cross_attn.project_kv(&encoder_output.hidden_states)?;
            cache.set_cross_attn(i, key, value)?;
        }
        Ok(cache)
    }

    fn step(
        &self,
        decoder_input_ids: &Array2<u32>,
        encoder_output: &EncoderOutput,
        cache: Option<DecoderCache>,
    ) -> Result<StepOutput> {
        let cur_len = decoder_input_ids.ncols();
        if cur_len == 0 {
            bail!("decoder input is empty");
        }

        match cache {
            Some(mut cache) => {
                let past_len = cache.self_attn_len();
                if past_len + 1 != cur_len {
                    bail!(
                        "cache holds {} positions but the decoder input has length {}",
                        past_len,
                        cur_len
                    );
                }
                let last = decoder_input_ids.slice(s![.., past_len..]).to_owned();
                let (logits, cross_attentions) =
                    self.decode(&last, encoder_output, Some(&mut cache), past_len)?;
                Ok(StepOutput {
                    logits,
                    cache: Some(cache),
                    cross_attentions,
                })
            }
            None => {
                let (logits, cross_attentions) =
                    self.decode(decoder_input_ids, encoder_output, None, 0)?;
                Ok(StepOutput {
                    logits,
                    cache: None,
                    cross_attentions,
                })
            }
        }
    }
}
