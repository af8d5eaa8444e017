//! Capability interface between the generation loop and a model.

use anyhow::Result;
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::cache::DecoderCache;
use crate::common::GenerationConfig;
use crate::error::{GenerationError, GenerationResult};

/// Architecture family of a seq2seq model.
///
/// The family only decides which generation defaults apply; the decoding
/// loop itself is the same for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// BART / mBART: forces BOS as the first generated token and EOS at the end.
    Bart,
    /// Marian MT: never generates the pad token, forces EOS at the end.
    Marian,
    T5,
}

/// Special token ids of a model vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub bos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub decoder_start_token_id: Option<u32>,
}

impl ModelFamily {
    /// Generation defaults of this family for the given special tokens.
    pub fn generation_defaults(self, tokens: &SpecialTokens) -> GenerationConfig {
        let mut config = GenerationConfig::default().with_special_tokens(
            tokens.bos_token_id,
            tokens.pad_token_id,
            tokens.eos_token_id,
        );
        config.decoder_start_token_id = tokens.decoder_start_token_id;

        match self {
            ModelFamily::Bart => {
                config.decoder_start_token_id =
                    tokens.decoder_start_token_id.or(tokens.eos_token_id);
                config.forced_bos_token_id = tokens.bos_token_id;
                config.forced_eos_token_id = tokens.eos_token_id;
            }
            ModelFamily::Marian => {
                config.decoder_start_token_id =
                    tokens.decoder_start_token_id.or(tokens.pad_token_id);
                if let Some(pad) = tokens.pad_token_id {
                    config.bad_words_ids = vec![vec![pad]];
                }
                config.forced_eos_token_id = tokens.eos_token_id;
            }
            ModelFamily::T5 => {
                config.decoder_start_token_id =
                    tokens.decoder_start_token_id.or(tokens.pad_token_id);
            }
        }
        config
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelFamily::Bart => "bart",
            ModelFamily::Marian => "marian",
            ModelFamily::T5 => "t5",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bart" | "mbart" => Ok(ModelFamily::Bart),
            "marian" => Ok(ModelFamily::Marian),
            "t5" => Ok(ModelFamily::T5),
            _ => Err(format!("unknown model family: {}", s)),
        }
    }
}

/// What the encoder runs on: token ids or pre-computed embeddings, never both.
#[derive(Debug, Clone)]
pub enum EncoderInput {
    /// `[batch, src_len]` token ids.
    TokenIds {
        input_ids: Array2<u32>,
        attention_mask: Option<Array2<f32>>,
    },
    /// `[batch, src_len, hidden]` embeddings.
    Embeddings {
        inputs_embeds: Array3<f32>,
        attention_mask: Option<Array2<f32>>,
    },
}

impl EncoderInput {
    pub fn from_ids(input_ids: Array2<u32>) -> Self {
        EncoderInput::TokenIds {
            input_ids,
            attention_mask: None,
        }
    }

    pub fn from_embeddings(inputs_embeds: Array3<f32>) -> Self {
        EncoderInput::Embeddings {
            inputs_embeds,
            attention_mask: None,
        }
    }

    /// Builds an input from optional parts, rejecting both-or-neither.
    pub fn from_parts(
        input_ids: Option<Array2<u32>>,
        inputs_embeds: Option<Array3<f32>>,
        attention_mask: Option<Array2<f32>>,
    ) -> GenerationResult<Self> {
        match (input_ids, inputs_embeds) {
            (Some(_), Some(_)) => Err(GenerationError::ConflictingInputs),
            (None, None) => Err(GenerationError::MissingInput),
            (Some(input_ids), None) => Ok(EncoderInput::TokenIds {
                input_ids,
                attention_mask,
            }),
            (None, Some(inputs_embeds)) => Ok(EncoderInput::Embeddings {
                inputs_embeds,
                attention_mask,
            }),
        }
    }

    /// Padding mask, `1.0` for real positions and `0.0` for padding.
    pub fn with_attention_mask(mut self, mask: Array2<f32>) -> Self {
        match &mut self {
            EncoderInput::TokenIds { attention_mask, .. }
            | EncoderInput::Embeddings { attention_mask, .. } => *attention_mask = Some(mask),
        }
        self
    }

    pub fn attention_mask(&self) -> Option<&Array2<f32>> {
        match self {
            EncoderInput::TokenIds { attention_mask, .. }
            | EncoderInput::Embeddings { attention_mask, .. } => attention_mask.as_ref(),
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            EncoderInput::TokenIds { input_ids, .. } => input_ids.nrows(),
            EncoderInput::Embeddings { inputs_embeds, .. } => inputs_embeds.shape()[0],
        }
    }

    pub fn src_len(&self) -> usize {
        match self {
            EncoderInput::TokenIds { input_ids, .. } => input_ids.ncols(),
            EncoderInput::Embeddings { inputs_embeds, .. } => inputs_embeds.shape()[1],
        }
    }
}

/// Output of the encoder, computed once per generation call.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, src_len, hidden]`
    pub hidden_states: Array3<f32>,
    /// `[batch, src_len]`, `None` when no position is padded.
    pub attention_mask: Option<Array2<f32>>,
}

impl EncoderOutput {
    pub fn batch_size(&self) -> usize {
        self.hidden_states.shape()[0]
    }

    pub fn src_len(&self) -> usize {
        self.hidden_states.shape()[1]
    }

    /// Gathers hidden states and padding mask along the batch axis.
    pub fn reorder(&self, indices: &[usize]) -> Result<Self> {
        let batch_size = self.batch_size();
        if let Some(&bad) = indices.iter().find(|&&idx| idx >= batch_size) {
            anyhow::bail!(
                "reorder index {} out of range for encoder batch size {}",
                bad,
                batch_size
            );
        }
        if let Some(mask) = &self.attention_mask {
            if mask.nrows() != batch_size {
                anyhow::bail!(
                    "encoder mask has {} rows for batch size {}",
                    mask.nrows(),
                    batch_size
                );
            }
        }
        Ok(Self {
            hidden_states: self.hidden_states.select(Axis(0), indices),
            attention_mask: self
                .attention_mask
                .as_ref()
                .map(|mask| mask.select(Axis(0), indices)),
        })
    }
}

/// Output of a single decoder step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Next-token logits for the last position, `[batch, vocab]`.
    pub logits: Array2<f32>,
    /// The updated cache when one was passed in.
    pub cache: Option<DecoderCache>,
    /// Cross-attention weights of the last position, one `[batch, heads, src_len]`
    /// tensor per decoder layer.
    pub cross_attentions: Vec<Array3<f32>>,
}

/// An encoder-decoder model the generation loop can drive.
///
/// Implementations are free to run on any backend; the loop only exchanges
/// owned ndarray tensors and the [`DecoderCache`] with them.
pub trait Seq2SeqModel: Send + Sync {
    fn family(&self) -> ModelFamily;

    fn num_layers(&self) -> usize;

    /// Attention heads of the decoder cross-attention.
    fn num_heads(&self) -> usize;

    fn vocab_size(&self) -> usize;

    fn special_tokens(&self) -> SpecialTokens;

    fn encode(&self, input: EncoderInput) -> Result<EncoderOutput>;

    /// Builds a cache whose cross-attention entries are filled from the
    /// encoder output and whose self-attention entries are empty.
    fn initial_cache(&self, encoder_output: &EncoderOutput) -> Result<DecoderCache>;

    /// Runs the decoder on `decoder_input_ids` (`[batch, cur_len]`).
    ///
    /// With a cache only the last column is fed through the decoder and the
    /// cache must hold exactly `cur_len - 1` positions. Without one the whole
    /// history is recomputed and the returned cache is `None`.
    fn step(
        &self,
        decoder_input_ids: &Array2<u32>,
        encoder_output: &EncoderOutput,
        cache: Option<DecoderCache>,
    ) -> Result<StepOutput>;

    /// Gathers the cache and the encoder output with the same batch indices,
    /// so cross-attention keys/values and the padding mask stay aligned.
    fn reorder_cache(
        &self,
        cache: DecoderCache,
        encoder_output: &EncoderOutput,
        indices: &[usize],
    ) -> Result<(DecoderCache, EncoderOutput)> {
        let encoder_output = encoder_output.reorder(indices)?;
        Ok((cache.into_reordered(indices)?, encoder_output))
    }

    fn default_generation_config(&self) -> GenerationConfig {
        self.family().generation_defaults(&self.special_tokens())
    }
}
