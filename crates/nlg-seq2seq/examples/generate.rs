//! Runs the generation loop on a randomly initialised reference model.
//!
//! ```text
//! cargo run --example generate -- --family marian --input 5,9,13 --input 7,8 --sample --seed 3
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use ndarray::Array2;

use nlg_seq2seq::prelude::*;
use nlg_seq2seq::{CpuSeq2SeqModel, ReferenceConfig};

#[derive(Parser, Debug)]
#[command(name = "generate")]
#[command(about = "Beam-free seq2seq generation on a random reference model", long_about = None)]
struct Args {
    /// Model family (bart, marian, t5)
    #[arg(short, long, default_value = "bart")]
    family: ModelFamily,

    /// Reference model config (JSON). Overrides --family.
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// generation_config.json style file. Flags below are applied on top.
    #[arg(long)]
    generation_config: Option<PathBuf>,

    /// Comma-separated source token ids, one flag per batch entry
    #[arg(short, long, required = true)]
    input: Vec<String>,

    /// Maximum decoder length, start token included
    #[arg(short = 'n', long)]
    max_length: Option<usize>,

    #[arg(long)]
    min_length: Option<usize>,

    /// Sample instead of greedy arg-max
    #[arg(long)]
    sample: bool,

    #[arg(short, long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    repetition_penalty: Option<f32>,

    #[arg(long)]
    no_repeat_ngram_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Recompute the full decoder history every step
    #[arg(long)]
    no_cache: bool,

    /// Weight initialisation seed of the reference model
    #[arg(long, default_value_t = 0)]
    model_seed: u64,
}

/// Parses the `--input` rows and pads them to a common length.
fn parse_inputs(rows: &[String], pad: u32) -> Result<(Array2<u32>, Array2<f32>)> {
    let parsed = rows
        .iter()
        .map(|row| {
            row.split(',')
                .map(|id| id.trim().parse::<u32>().map_err(|e| anyhow!("bad token id {:?}: {}", id, e)))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    let src_len = parsed.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = Array2::from_elem((parsed.len(), src_len), pad);
    let mut mask = Array2::zeros((parsed.len(), src_len));
    for (b, row) in parsed.iter().enumerate() {
        for (t, &id) in row.iter().enumerate() {
            ids[[b, t]] = id;
            mask[[b, t]] = 1.0;
        }
    }
    Ok((ids, mask))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let model_config = match &args.model_config {
        Some(path) => ReferenceConfig::from_file(path)?,
        None => ReferenceConfig::tiny(args.family).with_seed(args.model_seed),
    };
    log::info!(
        "Building reference {} model (seed {})",
        model_config.family,
        model_config.seed
    );
    let pad = model_config.special_tokens.pad_token_id.unwrap_or(0);
    let generator = Seq2SeqGenerator::new(Box::new(CpuSeq2SeqModel::new(model_config)?));

    let mut config = match &args.generation_config {
        Some(path) => GenerationConfig::from_file(path)?,
        None => generator.default_config(),
    };
    if let Some(max_length) = args.max_length {
        config.max_length = max_length;
    }
    if let Some(min_length) = args.min_length {
        config.min_length = min_length;
    }
    if args.sample {
        config.do_sample = true;
    }
    if let Some(temperature) = args.temperature {
        config.temperature = temperature;
    }
    if let Some(top_k) = args.top_k {
        config.top_k = top_k;
    }
    if let Some(top_p) = args.top_p {
        config.top_p = top_p;
    }
    if let Some(penalty) = args.repetition_penalty {
        config.repetition_penalty = penalty;
    }
    if let Some(size) = args.no_repeat_ngram_size {
        config.no_repeat_ngram_size = size;
    }
    config.seed = args.seed.or(config.seed);
    config.use_cache = !args.no_cache;

    let (ids, mask) = parse_inputs(&args.input, pad)?;
    let input = EncoderInput::from_ids(ids).with_attention_mask(mask);

    let output = generator.generate(input, &config)?;

    println!("--- GENERATED SEQUENCES ---");
    for b in 0..output.batch_size() {
        println!(
            "[{}] len {:>3}: {:?}",
            b,
            output.sequence_lengths[b],
            output.sequence(b).to_vec()
        );
    }
    Ok(())
}
