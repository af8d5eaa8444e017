//! Error types for seq2seq generation.

use thiserror::Error;

/// Errors that can occur during generation.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The generation config is degenerate or inconsistent with the model.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Both token ids and pre-computed embeddings were supplied to the encoder.
    #[error("Conflicting inputs: pass either input ids or input embeddings, not both")]
    ConflictingInputs,

    /// Neither token ids nor embeddings were supplied to the encoder.
    #[error("Missing input: pass either input ids or input embeddings")]
    MissingInput,

    /// Sequences finished at different lengths and no pad id is configured.
    #[error("`pad_token_id` has to be defined if sequences in the batch have different lengths ({min} vs {max})")]
    MissingPadToken { min: usize, max: usize },

    /// Neither `decoder_start_token_id` nor `bos_token_id` is configured.
    #[error("Cannot start decoding: neither `decoder_start_token_id` nor `bos_token_id` is defined")]
    MissingStartToken,

    /// Every logit of a row was masked out.
    #[error("No valid token left to pick for sequence {batch_index} at length {cur_len}")]
    NoValidToken { batch_index: usize, cur_len: usize },

    /// Generation was cancelled between two steps.
    #[error("Generation cancelled at length {cur_len}")]
    Cancelled { cur_len: usize },

    /// The incremental cache is in an inconsistent state.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A model forward pass failed.
    #[error("Model forward pass failed: {0}")]
    Model(#[from] anyhow::Error),
}

/// Result type for generation operations.
pub type GenerationResult<T> = Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_pad_message_mentions_lengths() {
        let err = GenerationError::MissingPadToken { min: 3, max: 5 };
        let msg = err.to_string();
        assert!(msg.contains("pad_token_id"));
        assert!(msg.contains("3 vs 5"));
    }

    #[test]
    fn test_anyhow_converts_into_model_error() {
        let err: GenerationError = anyhow::anyhow!("shape mismatch").into();
        assert!(matches!(err, GenerationError::Model(_)));
        assert!(err.to_string().contains("shape mismatch"));
    }
}
