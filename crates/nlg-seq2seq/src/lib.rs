//! Beam-free autoregressive generation for encoder-decoder transformers.
//!
//! This crate provides the decoding loop shared by BART, Marian and T5 style
//! seq2seq models: incremental per-layer KV caches, logit masking rules,
//! greedy and stochastic token selection, and the per-sequence termination
//! protocol. Models plug in through the [`Seq2SeqModel`] capability trait.
//!
//! A small CPU reference encoder-decoder lives in [`models`] so the loop can
//! run end to end without pretrained weights.

pub mod activations;
pub mod cache;
pub mod common;
pub mod error;
pub mod generation;
pub mod models;

#[cfg(test)]
mod tests;

pub use cache::{DecoderCache, KeyValue, LayerCache};
pub use common::{CancellationHandle, CancellationToken, GenerationConfig};
pub use error::{GenerationError, GenerationResult};
pub use generation::{
    EncoderInput, EncoderOutput, GenerationOutput, ModelFamily, Seq2SeqGenerator, Seq2SeqModel,
    SequenceStatus, SpecialTokens, StepOutput, TerminationTracker,
};
pub use models::{CpuSeq2SeqModel, ReferenceConfig};

// Prelude for easy imports
pub mod prelude {
    pub use crate::cache::DecoderCache;
    pub use crate::common::{CancellationToken, GenerationConfig};
    pub use crate::error::{GenerationError, GenerationResult};
    pub use crate::generation::{EncoderInput, ModelFamily, Seq2SeqGenerator, Seq2SeqModel};
}
