use std::time::Instant;

use anyhow::anyhow;
use ndarray::{s, Array2, Array3, Array4, ArrayView1, Axis};
use rayon::prelude::*;

use crate::cache::{DecoderCache, KeyValue};
use crate::common::{apply_masking_rules, CancellationToken, GenerationConfig, Sampler};
use crate::error::{GenerationError, GenerationResult};
use crate::generation::termination::TerminationTracker;
use crate::generation::traits::{EncoderInput, Seq2SeqModel, StepOutput};

/// Fill value of cross-attention rows that were never written.
pub const UNWRITTEN_ATTENTION: f32 = -1_000_000.0;

/// Result of a generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// `[batch, max_final_len]`, decoder start token included. Positions past a
    /// sequence's final length hold the pad id.
    pub sequences: Array2<u32>,
    /// Final length of each sequence, EOS included.
    pub sequence_lengths: Vec<usize>,
    /// One `[batch, heads, max_final_len, src_len]` trace per decoder layer.
    /// Row `t` holds the attention of the step that produced token `t + 1`.
    pub cross_attentions: Vec<Array4<f32>>,
}

impl GenerationOutput {
    pub fn batch_size(&self) -> usize {
        self.sequences.nrows()
    }

    /// The tokens of sequence `index` up to its final length.
    pub fn sequence(&self, index: usize) -> ArrayView1<'_, u32> {
        self.sequences.slice(s![index, ..self.sequence_lengths[index]])
    }
}

/// Beam-free generation loop over any [`Seq2SeqModel`].
pub struct Seq2SeqGenerator {
    model: Box<dyn Seq2SeqModel>,
}

impl Seq2SeqGenerator {
    pub fn new(model: Box<dyn Seq2SeqModel>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &dyn Seq2SeqModel {
        self.model.as_ref()
    }

    /// The model family's defaults, a starting point for callers.
    pub fn default_config(&self) -> GenerationConfig {
        self.model.default_generation_config()
    }

    pub fn generate(
        &self,
        input: EncoderInput,
        config: &GenerationConfig,
    ) -> GenerationResult<GenerationOutput> {
        self.generate_cancellable(input, config, CancellationToken::never())
    }

    /// Same as [`Seq2SeqGenerator::generate`], checking `cancellation` before
    /// every decoding step.
    pub fn generate_cancellable(
        &self,
        input: EncoderInput,
        config: &GenerationConfig,
        cancellation: CancellationToken,
    ) -> GenerationResult<GenerationOutput> {
        let t_start = Instant::now();
        let result = self.run(input, config, &cancellation);

        let elapsed = t_start.elapsed();
        match &result {
            Ok(output) => {
                let num_tokens: usize = output
                    .sequence_lengths
                    .iter()
                    .map(|len| len.saturating_sub(1))
                    .sum();
                if num_tokens > 0 && elapsed.as_secs_f32() > 0.0 {
                    let tps = num_tokens as f32 / elapsed.as_secs_f32();
                    log::info!(
                        "[Seq2Seq] Generated {} tokens in {:?}. Speed: {:.2} t/s",
                        num_tokens,
                        elapsed,
                        tps
                    );
                } else {
                    log::info!("[Seq2Seq] Total Generation Time: {:?}", elapsed);
                }
            }
            Err(e) => log::info!("[Seq2Seq] Total Generation Time (failed: {}): {:?}", e, elapsed),
        }

        result
    }

    fn run(
        &self,
        input: EncoderInput,
        config: &GenerationConfig,
        cancellation: &CancellationToken,
    ) -> GenerationResult<GenerationOutput> {
        let model = self.model.as_ref();

        // --- INIT ---
        config.validate(Some(model.vocab_size()))?;
        let batch_size = input.batch_size();
        if batch_size == 0 || input.src_len() == 0 {
            return Err(GenerationError::MissingInput);
        }
        let start_token = config
            .decoder_start()
            .ok_or(GenerationError::MissingStartToken)?;

        let encoder_output = model.encode(input)?;
        if encoder_output.batch_size() != batch_size {
            return Err(anyhow!(
                "encoder returned batch size {} for {} inputs",
                encoder_output.batch_size(),
                batch_size
            )
            .into());
        }

        let mut cache = if config.use_cache {
            Some(model.initial_cache(&encoder_output)?)
        } else {
            None
        };

        let max_length = config.max_length;
        let mut trace = vec![
            Array4::from_elem(
                (batch_size, model.num_heads(), max_length, encoder_output.src_len()),
                UNWRITTEN_ATTENTION,
            );
            model.num_layers()
        ];

        let mut sequences = Array2::from_elem((batch_size, 1), start_token);
        let mut sampler = Sampler::new(config);
        let mut tracker = TerminationTracker::new(
            batch_size,
            config.eos_token_id,
            config.pad_token_id,
            max_length,
        );
        let mut cur_len = 1;

        log::debug!(
            "[Seq2Seq] {} family, batch {}, src_len {}, max_length {}, sampling={}, cache={}",
            model.family(),
            batch_size,
            encoder_output.src_len(),
            max_length,
            sampler.is_sampling(),
            config.use_cache
        );

        // --- STEPPING ---
        while !tracker.is_done(cur_len) {
            cancellation.check(cur_len)?;

            let StepOutput {
                mut logits,
                cache: next_cache,
                cross_attentions,
            } = model.step(&sequences, &encoder_output, cache.take())?;

            if logits.dim() != (batch_size, model.vocab_size()) {
                return Err(anyhow!(
                    "step returned logits of shape {:?}, expected [{}, {}]",
                    logits.shape(),
                    batch_size,
                    model.vocab_size()
                )
                .into());
            }
            if config.use_cache {
                cache = Some(check_cache(next_cache, cur_len)?);
            }
            record_cross_attentions(&mut trace, &cross_attentions, cur_len - 1)?;

            apply_masking_rules(&mut logits, &sequences, config);

            let mut next_tokens = Vec::with_capacity(batch_size);
            for (batch_index, (row, status)) in logits
                .axis_iter(Axis(0))
                .zip(tracker.statuses())
                .enumerate()
            {
                if status.is_finished() {
                    // Replaced by the fill token below.
                    next_tokens.push(start_token);
                    continue;
                }
                let token = sampler
                    .sample_row(row)
                    .ok_or(GenerationError::NoValidToken { batch_index, cur_len })?;
                next_tokens.push(token);
            }
            tracker.mask_finished(&mut next_tokens);

            sequences
                .push_column(ArrayView1::from(&next_tokens[..]))
                .map_err(anyhow::Error::from)?;
            cur_len += 1;
            tracker.update(&next_tokens, cur_len);

            log::debug!(
                "[Seq2Seq] len {} -> {:?} ({}/{} finished)",
                cur_len,
                next_tokens,
                tracker.num_finished(),
                batch_size
            );
        }

        // --- DONE ---
        let sequence_lengths = tracker.lengths(cur_len);
        let max_len = sequence_lengths.iter().copied().max().unwrap_or(cur_len);
        let min_len = sequence_lengths.iter().copied().min().unwrap_or(cur_len);

        let sequences = if min_len != max_len {
            let pad = config
                .pad_token_id
                .ok_or(GenerationError::MissingPadToken { min: min_len, max: max_len })?;
            let mut padded = Array2::from_elem((batch_size, max_len), pad);
            for (b, &len) in sequence_lengths.iter().enumerate() {
                padded
                    .slice_mut(s![b, ..len])
                    .assign(&sequences.slice(s![b, ..len]));
            }
            padded
        } else {
            sequences.slice_move(s![.., ..max_len])
        };

        let cross_attentions = trace
            .into_iter()
            .map(|layer| layer.slice_move(s![.., .., ..max_len, ..]))
            .collect();

        Ok(GenerationOutput {
            sequences,
            sequence_lengths,
            cross_attentions,
        })
    }
}

/// The cache handed back by a step must cover every position fed so far.
fn check_cache(cache: Option<DecoderCache>, cur_len: usize) -> GenerationResult<DecoderCache> {
    let cache = cache.ok_or_else(|| {
        GenerationError::Cache("model did not return a cache although use_cache is set".into())
    })?;
    for (layer_idx, layer) in cache.layers().iter().enumerate() {
        let cached = layer.self_attn.as_ref().map_or(0, KeyValue::seq_len);
        if cached != cur_len {
            return Err(GenerationError::Cache(format!(
                "layer {} self-attention cache holds {} positions after a step at length {}",
                layer_idx, cached, cur_len
            )));
        }
    }
    Ok(cache)
}

/// Writes one step's per-layer attention into row `row` of each trace.
fn record_cross_attentions(
    trace: &mut [Array4<f32>],
    step: &[Array3<f32>],
    row: usize,
) -> anyhow::Result<()> {
    if step.len() != trace.len() {
        anyhow::bail!(
            "step returned cross-attention for {} layers, model has {}",
            step.len(),
            trace.len()
        );
    }
    for (layer_idx, (buffer, weights)) in trace.iter().zip(step).enumerate() {
        let (batch, heads, _, src_len) = buffer.dim();
        if weights.dim() != (batch, heads, src_len) {
            anyhow::bail!(
                "cross-attention of layer {} has shape {:?}, expected [{}, {}, {}]",
                layer_idx,
                weights.shape(),
                batch,
                heads,
                src_len
            );
        }
    }

    trace
        .par_iter_mut()
        .zip(step.par_iter())
        .for_each(|(buffer, weights)| {
            buffer.slice_mut(s![.., .., row, ..]).assign(weights);
        });
    Ok(())
}
