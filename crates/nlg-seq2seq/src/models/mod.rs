//! A small CPU encoder-decoder used to drive the generation loop without
//! pretrained weights.
//!
//! The layers follow the usual BART / Marian / T5 layout closely enough for
//! the family defaults to make sense, but the weights are random.

pub mod attention;
pub mod config;
pub mod layers;
mod model;

pub use config::{PositionEncoding, ReferenceConfig};
pub use model::CpuSeq2SeqModel;
