//! Generation configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, GenerationResult};

/// Parameters of a single beam-free generation call.
///
/// Field names follow the Hugging Face `generation_config.json` layout, so a
/// checkpoint's config file can be deserialized directly. Missing fields fall
/// back to [`GenerationConfig::default`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Total decoder length budget, decoder start token included.
    pub max_length: usize,
    /// EOS is suppressed while the running length is below this.
    pub min_length: usize,
    /// Sample from the filtered distribution instead of taking the arg-max.
    pub do_sample: bool,
    pub temperature: f32,
    /// Keep only the `top_k` highest logits when sampling. `0` disables.
    pub top_k: usize,
    /// Nucleus threshold in `(0, 1]`. `1.0` disables.
    pub top_p: f32,
    /// CTRL-style penalty on tokens already in the history. `1.0` disables.
    pub repetition_penalty: f32,
    /// Forbid repeating any n-gram of this size. `0` disables.
    pub no_repeat_ngram_size: usize,
    /// Token phrases that must never be generated.
    pub bad_words_ids: Vec<Vec<u32>>,
    pub bos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    /// First decoder token. Falls back to `bos_token_id`.
    pub decoder_start_token_id: Option<u32>,
    /// Token forced as the first generated token.
    pub forced_bos_token_id: Option<u32>,
    /// Token forced when the length budget is about to run out.
    pub forced_eos_token_id: Option<u32>,
    /// Reuse self-attention keys/values across steps.
    pub use_cache: bool,
    /// RNG seed for sampling. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            min_length: 0,
            do_sample: false,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            bad_words_ids: Vec::new(),
            bos_token_id: None,
            pad_token_id: None,
            eos_token_id: None,
            decoder_start_token_id: None,
            forced_bos_token_id: None,
            forced_eos_token_id: None,
            use_cache: true,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Arg-max decoding up to `max_length` tokens.
    pub fn greedy(max_length: usize) -> Self {
        Self {
            max_length,
            do_sample: false,
            ..Default::default()
        }
    }

    /// Temperature sampling without top-k or nucleus truncation.
    pub fn sampling(max_length: usize, temperature: f32) -> Self {
        Self {
            max_length,
            do_sample: true,
            temperature,
            top_k: 0,
            top_p: 1.0,
            ..Default::default()
        }
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    pub fn with_no_repeat_ngram_size(mut self, size: usize) -> Self {
        self.no_repeat_ngram_size = size;
        self
    }

    pub fn with_bad_words(mut self, bad_words_ids: Vec<Vec<u32>>) -> Self {
        self.bad_words_ids = bad_words_ids;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Sets the BOS, PAD and EOS ids in one go.
    pub fn with_special_tokens(
        mut self,
        bos_token_id: Option<u32>,
        pad_token_id: Option<u32>,
        eos_token_id: Option<u32>,
    ) -> Self {
        self.bos_token_id = bos_token_id;
        self.pad_token_id = pad_token_id;
        self.eos_token_id = eos_token_id;
        self
    }

    /// The token every decoder sequence starts with.
    pub fn decoder_start(&self) -> Option<u32> {
        self.decoder_start_token_id.or(self.bos_token_id)
    }

    /// Parses a JSON generation config.
    pub fn from_json_str(json: &str) -> GenerationResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| GenerationError::InvalidConfig(format!("malformed generation config: {}", e)))
    }

    /// Loads a `generation_config.json` style file.
    pub fn from_file(path: impl AsRef<Path>) -> GenerationResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            GenerationError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Rejects degenerate settings before any computation happens.
    ///
    /// `vocab_size`, when known, bounds every configured token id.
    pub fn validate(&self, vocab_size: Option<usize>) -> GenerationResult<()> {
        let invalid = |msg: String| -> GenerationResult<()> { Err(GenerationError::InvalidConfig(msg)) };

        if self.max_length == 0 {
            return invalid("max_length must be at least 1".into());
        }
        if self.min_length > 0 && self.min_length >= self.max_length {
            return invalid(format!(
                "min_length ({}) must be smaller than max_length ({})",
                self.min_length, self.max_length
            ));
        }
        if self.do_sample && !(self.temperature.is_finite() && self.temperature > 0.0) {
            return invalid(format!(
                "temperature must be a positive finite number, got {}",
                self.temperature
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return invalid(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return invalid(format!(
                "repetition_penalty must be a positive finite number, got {}",
                self.repetition_penalty
            ));
        }
        if let Some(idx) = self.bad_words_ids.iter().position(|w| w.is_empty()) {
            return invalid(format!("bad_words_ids[{}] is empty", idx));
        }

        if let Some(vocab_size) = vocab_size {
            let named = [
                ("bos_token_id", self.bos_token_id),
                ("pad_token_id", self.pad_token_id),
                ("eos_token_id", self.eos_token_id),
                ("decoder_start_token_id", self.decoder_start_token_id),
                ("forced_bos_token_id", self.forced_bos_token_id),
                ("forced_eos_token_id", self.forced_eos_token_id),
            ];
            for (name, id) in named {
                if let Some(id) = id {
                    if id as usize >= vocab_size {
                        return invalid(format!(
                            "{} ({}) is outside the vocabulary (size {})",
                            name, id, vocab_size
                        ));
                    }
                }
            }
            if let Some(&id) = self.bad_words_ids.iter().flatten().find(|&&id| id as usize >= vocab_size) {
                return invalid(format!(
                    "bad word token {} is outside the vocabulary (size {})",
                    id, vocab_size
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_greedy_with_cache() {
        let config = GenerationConfig::default();
        assert!(!config.do_sample);
        assert!(config.use_cache);
        assert_eq!(config.max_length, 20);
        assert!(config.validate(None).is_ok());
    }

    #[test]
    fn test_json_fills_missing_fields_with_defaults() {
        let config = GenerationConfig::from_json_str(
            r#"{"max_length": 64, "eos_token_id": 2, "pad_token_id": 1, "bad_words_ids": [[1], [7, 8]]}"#,
        )
        .unwrap();
        assert_eq!(config.max_length, 64);
        assert_eq!(config.eos_token_id, Some(2));
        assert_eq!(config.bad_words_ids, vec![vec![1], vec![7, 8]]);
        assert_eq!(config.repetition_penalty, 1.0);
        assert!(config.use_cache);
    }

    #[test]
    fn test_json_rejects_negative_top_k() {
        let err = GenerationConfig::from_json_str(r#"{"top_k": -3}"#).unwrap_err();
        assert!(matches!(err, GenerationError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_length": 12, "do_sample": true, "top_p": 0.9, "seed": 7}}"#).unwrap();
        let config = GenerationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_length, 12);
        assert!(config.do_sample);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn test_from_missing_file_is_config_error() {
        let err = GenerationConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, GenerationError::InvalidConfig(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let config = GenerationConfig::sampling(30, 0.8)
            .with_top_k(5)
            .with_seed(3)
            .with_special_tokens(Some(0), Some(1), Some(2));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(GenerationConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_validate_min_length_not_below_max() {
        let config = GenerationConfig::greedy(5).with_min_length(5);
        assert!(config.validate(None).is_err());
        let config = GenerationConfig::greedy(5).with_min_length(4);
        assert!(config.validate(None).is_ok());
    }

    #[test]
    fn test_validate_top_p_range() {
        assert!(GenerationConfig::default().with_top_p(0.0).validate(None).is_err());
        assert!(GenerationConfig::default().with_top_p(1.5).validate(None).is_err());
        assert!(GenerationConfig::default().with_top_p(1.0).validate(None).is_ok());
    }

    #[test]
    fn test_validate_temperature_only_when_sampling() {
        let mut config = GenerationConfig::greedy(10);
        config.temperature = 0.0;
        assert!(config.validate(None).is_ok());
        config.do_sample = true;
        assert!(config.validate(None).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_bad_word() {
        let config = GenerationConfig::default().with_bad_words(vec![vec![3], vec![]]);
        let err = config.validate(None).unwrap_err();
        assert!(err.to_string().contains("bad_words_ids[1]"));
    }

    #[test]
    fn test_validate_token_ids_against_vocab() {
        let config = GenerationConfig::default().with_special_tokens(Some(0), Some(1), Some(99));
        assert!(config.validate(Some(100)).is_ok());
        assert!(config.validate(Some(50)).is_err());
    }

    #[test]
    fn test_decoder_start_falls_back_to_bos() {
        let mut config = GenerationConfig::default().with_special_tokens(Some(0), None, None);
        assert_eq!(config.decoder_start(), Some(0));
        config.decoder_start_token_id = Some(2);
        assert_eq!(config.decoder_start(), Some(2));
    }
}
