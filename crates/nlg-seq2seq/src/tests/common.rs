use crate::generation::{Seq2SeqGenerator, Seq2SeqModel};
use crate::models::{CpuSeq2SeqModel, ReferenceConfig};
use crate::ModelFamily;

pub const FAMILIES: [ModelFamily; 3] = [ModelFamily::Bart, ModelFamily::Marian, ModelFamily::T5];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn reference_model(family: ModelFamily) -> CpuSeq2SeqModel {
    CpuSeq2SeqModel::new(ReferenceConfig::tiny(family).with_seed(42)).unwrap()
}

pub fn reference_generator(family: ModelFamily) -> Seq2SeqGenerator {
    Seq2SeqGenerator::new(Box::new(reference_model(family)))
}

/// Every sequence after its final length holds `fill`.
pub fn assert_padded_with(sequences: &ndarray::Array2<u32>, lengths: &[usize], fill: u32) {
    for (b, &len) in lengths.iter().enumerate() {
        assert!(
            sequences.row(b).iter().skip(len).all(|&t| t == fill),
            "sequence {} is not padded with {} after length {}",
            b,
            fill,
            len
        );
    }
}

pub fn vocab_size(model: &dyn Seq2SeqModel) -> u32 {
    model.vocab_size() as u32
}
