//! Hyper-parameters of the CPU reference encoder-decoder.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::generation::{ModelFamily, SpecialTokens};

/// How absolute positions enter the embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionEncoding {
    /// A trained table, as in BART.
    Learned,
    /// Fixed sine/cosine table, as in Marian.
    Sinusoidal,
    /// No absolute positions.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub family: ModelFamily,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub ffn_dim: usize,
    pub activation: Activation,
    /// Layer norm before each sub-layer (T5) instead of after it (BART, Marian).
    pub normalize_before: bool,
    pub position_encoding: PositionEncoding,
    pub max_position_embeddings: usize,
    /// Multiply token embeddings by `sqrt(hidden_size)`.
    pub scale_embedding: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default)]
    pub special_tokens: SpecialTokens,
    /// Seed of the random weight initialisation.
    #[serde(default)]
    pub seed: u64,
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

impl ReferenceConfig {
    /// A small model with the conventions of `family`.
    pub fn tiny(family: ModelFamily) -> Self {
        let vocab_size = 64;
        let base = Self {
            family,
            vocab_size,
            hidden_size: 32,
            num_heads: 4,
            encoder_layers: 2,
            decoder_layers: 2,
            ffn_dim: 64,
            activation: Activation::Gelu,
            normalize_before: false,
            position_encoding: PositionEncoding::Learned,
            max_position_embeddings: 128,
            scale_embedding: false,
            layer_norm_eps: default_layer_norm_eps(),
            special_tokens: SpecialTokens::default(),
            seed: 0,
        };

        match family {
            ModelFamily::Bart => Self {
                special_tokens: SpecialTokens {
                    bos_token_id: Some(0),
                    pad_token_id: Some(1),
                    eos_token_id: Some(2),
                    decoder_start_token_id: Some(2),
                },
                ..base
            },
            ModelFamily::Marian => Self {
                position_encoding: PositionEncoding::Sinusoidal,
                scale_embedding: true,
                special_tokens: SpecialTokens {
                    bos_token_id: None,
                    pad_token_id: Some(vocab_size as u32 - 1),
                    eos_token_id: Some(0),
                    decoder_start_token_id: Some(vocab_size as u32 - 1),
                },
                ..base
            },
            ModelFamily::T5 => Self {
                activation: Activation::Relu,
                normalize_before: true,
                position_encoding: PositionEncoding::None,
                layer_norm_eps: 1e-6,
                special_tokens: SpecialTokens {
                    bos_token_id: None,
                    pad_token_id: Some(0),
                    eos_token_id: Some(1),
                    decoder_start_token_id: Some(0),
                },
                ..base
            },
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("malformed reference model config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_heads == 0 {
            bail!("vocab_size, hidden_size and num_heads must be non-zero");
        }
        if self.hidden_size % self.num_heads != 0 {
            bail!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size,
                self.num_heads
            );
        }
        if self.position_encoding == PositionEncoding::Sinusoidal && self.hidden_size % 2 != 0 {
            bail!("sinusoidal positions need an even hidden_size");
        }
        let tokens = [
            self.special_tokens.bos_token_id,
            self.special_tokens.pad_token_id,
            self.special_tokens.eos_token_id,
            self.special_tokens.decoder_start_token_id,
        ];
        if let Some(id) = tokens.into_iter().flatten().find(|&id| id as usize >= self.vocab_size) {
            return Err(anyhow!(
                "special token {} is outside the vocabulary (size {})",
                id,
                self.vocab_size
            ));
        }
        Ok(())
    }
}
