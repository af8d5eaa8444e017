//! Logit masking rules applied before token selection.
//!
//! Every rule works on a single sequence: its logit row over the vocabulary and
//! the tokens generated so far (decoder start token included). Rules that ban
//! tokens return the banned ids so callers can inspect them; the `*_inplace`
//! helpers write `-inf` into the row.

use std::collections::HashSet;

use ndarray::{Array2, ArrayBase, Axis, DataMut, Ix1};

use crate::common::GenerationConfig;

/// Apply repetition penalty in-place - works with both Array1 and ArrayViewMut1
///
/// Each distinct token in `tokens` is penalized once: positive logits are
/// divided by `penalty`, negative ones multiplied.
pub fn apply_repetition_penalty_inplace<S>(
    logits: &mut ArrayBase<S, Ix1>,
    tokens: &[u32],
    penalty: f32,
) where
    S: DataMut<Elem = f32>,
{
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<u32> = tokens.iter().copied().collect();
    for token in seen {
        let idx = token as usize;
        if idx < logits.len() {
            let score = logits[idx];
            if score < 0.0 {
                logits[idx] = score * penalty;
            } else {
                logits[idx] = score / penalty;
            }
        }
    }
}

/// Tokens that would complete an n-gram already present in `tokens`.
pub fn calc_banned_ngram_tokens(tokens: &[u32], ngram_size: usize) -> Vec<u32> {
    let n = ngram_size;
    // Not enough history to have seen any n-gram yet.
    if n == 0 || tokens.len() + 1 < n {
        return Vec::new();
    }

    // The last n-1 tokens form the current prefix
    let current_prefix = &tokens[tokens.len() - (n - 1)..];

    tokens
        .windows(n)
        .filter(|window| &window[..n - 1] == current_prefix)
        .map(|window| window[n - 1])
        .collect()
}

/// Tokens that would complete one of the `bad_words_ids` phrases.
///
/// A single-token phrase is always banned; a longer phrase bans its last token
/// only when the history ends with the rest of the phrase.
pub fn calc_banned_bad_words_tokens(tokens: &[u32], bad_words_ids: &[Vec<u32>]) -> Vec<u32> {
    bad_words_ids
        .iter()
        .filter_map(|phrase| {
            let (&last, prefix) = phrase.split_last()?;
            tokens.ends_with(prefix).then_some(last)
        })
        .collect()
}

/// Sets every listed token to `-inf`. Ids outside the vocabulary are ignored.
pub fn ban_tokens_inplace<S>(logits: &mut ArrayBase<S, Ix1>, banned: &[u32])
where
    S: DataMut<Elem = f32>,
{
    for &token in banned {
        let idx = token as usize;
        if idx < logits.len() {
            logits[idx] = f32::NEG_INFINITY;
        }
    }
}

/// Apply no-repeat n-gram blocking in-place - works with both Array1 and ArrayViewMut1
pub fn apply_no_repeat_ngram_inplace<S>(logits: &mut ArrayBase<S, Ix1>, tokens: &[u32], ngram_size: usize)
where
    S: DataMut<Elem = f32>,
{
    let banned = calc_banned_ngram_tokens(tokens, ngram_size);
    ban_tokens_inplace(logits, &banned);
}

pub fn apply_bad_words_inplace<S>(logits: &mut ArrayBase<S, Ix1>, tokens: &[u32], bad_words_ids: &[Vec<u32>])
where
    S: DataMut<Elem = f32>,
{
    let banned = calc_banned_bad_words_tokens(tokens, bad_words_ids);
    ban_tokens_inplace(logits, &banned);
}

/// Forces `token_id` to be picked: every other logit becomes `-inf`.
///
/// The forced logit is reset to `0.0` so that earlier suppression rules
/// cannot leave the row without a valid token.
pub fn force_token_inplace<S>(logits: &mut ArrayBase<S, Ix1>, token_id: u32)
where
    S: DataMut<Elem = f32>,
{
    let idx = token_id as usize;
    if idx >= logits.len() {
        return;
    }
    logits.fill(f32::NEG_INFINITY);
    logits[idx] = 0.0;
}

/// Runs every configured rule over a `[batch, vocab]` logit matrix.
///
/// `histories` is the running `[batch, cur_len]` token matrix. Order:
/// repetition penalty, n-gram ban, bad words, min length, forced tokens.
/// Forcing runs last and overrides everything before it.
pub fn apply_masking_rules(
    logits: &mut Array2<f32>,
    histories: &Array2<u32>,
    config: &GenerationConfig,
) {
    let cur_len = histories.ncols();

    for (mut row, history) in logits
        .axis_iter_mut(Axis(0))
        .zip(histories.axis_iter(Axis(0)))
    {
        let history = history.to_vec();

        if config.repetition_penalty != 1.0 {
            apply_repetition_penalty_inplace(&mut row, &history, config.repetition_penalty);
        }
        if config.no_repeat_ngram_size > 0 {
            apply_no_repeat_ngram_inplace(&mut row, &history, config.no_repeat_ngram_size);
        }
        if !config.bad_words_ids.is_empty() {
            apply_bad_words_inplace(&mut row, &history, &config.bad_words_ids);
        }
        if let Some(eos) = config.eos_token_id {
            if cur_len < config.min_length {
                ban_tokens_inplace(&mut row, &[eos]);
            }
        }

        if cur_len == 1 {
            if let Some(bos) = config.forced_bos_token_id {
                force_token_inplace(&mut row, bos);
            }
        }
        if cur_len + 1 == config.max_length {
            if let Some(eos) = config.forced_eos_token_id {
                force_token_inplace(&mut row, eos);
            }
        }
    }
}
