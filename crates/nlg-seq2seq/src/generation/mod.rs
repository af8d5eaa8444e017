//! The beam-free decoding loop and the interface models implement for it.

pub mod generator;
pub mod termination;
pub mod traits;

pub use generator::{GenerationOutput, Seq2SeqGenerator, UNWRITTEN_ATTENTION};
pub use termination::{SequenceStatus, TerminationTracker};
pub use traits::{EncoderInput, EncoderOutput, ModelFamily, Seq2SeqModel, SpecialTokens, StepOutput};
