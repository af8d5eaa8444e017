//! Per-layer key/value cache for incremental encoder-decoder decoding.
//!
//! All tensors use the `[batch, seq, hidden]` layout. The self-attention entry
//! grows by one position per decoding step, the cross-attention entry is
//! computed once from the encoder output and never changes afterwards.

use anyhow::{anyhow, bail, Result};
use ndarray::{concatenate, Array3, Axis};
use rayon::prelude::*;

/// A key tensor and its matching value tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValue {
    pub key: Array3<f32>,
    pub value: Array3<f32>,
}

impl KeyValue {
    pub fn new(key: Array3<f32>, value: Array3<f32>) -> Result<Self> {
        if key.dim() != value.dim() {
            bail!(
                "key/value shape mismatch: {:?} vs {:?}",
                key.shape(),
                value.shape()
            );
        }
        Ok(Self { key, value })
    }

    pub fn batch_size(&self) -> usize {
        self.key.shape()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.key.shape()[1]
    }

    pub fn hidden_size(&self) -> usize {
        self.key.shape()[2]
    }

    /// Concatenates `key`/`value` after the stored positions.
    fn append(&mut self, key: &Array3<f32>, value: &Array3<f32>) -> Result<()> {
        if key.dim() != value.dim() {
            bail!(
                "key/value shape mismatch: {:?} vs {:?}",
                key.shape(),
                value.shape()
            );
        }
        let (batch, _, hidden) = key.dim();
        if batch != self.batch_size() || hidden != self.hidden_size() {
            bail!(
                "cannot append [{}, _, {}] to cache entry [{}, {}, {}]",
                batch,
                hidden,
                self.batch_size(),
                self.seq_len(),
                self.hidden_size()
            );
        }
        self.key = concatenate(Axis(1), &[self.key.view(), key.view()])?;
        self.value = concatenate(Axis(1), &[self.value.view(), value.view()])?;
        Ok(())
    }

    /// Gathers batch rows; `indices` were bounds-checked by the caller.
    fn select_batch(&self, indices: &[usize]) -> Self {
        Self {
            key: self.key.select(Axis(0), indices),
            value: self.value.select(Axis(0), indices),
        }
    }
}

/// Cached state of a single decoder layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerCache {
    pub self_attn: Option<KeyValue>,
    pub cross_attn: Option<KeyValue>,
}

impl LayerCache {
    fn batch_size(&self) -> Option<usize> {
        self.self_attn
            .as_ref()
            .or(self.cross_attn.as_ref())
            .map(KeyValue::batch_size)
    }

    fn reorder(&self, indices: &[usize]) -> Self {
        Self {
            self_attn: self.self_attn.as_ref().map(|kv| kv.select_batch(indices)),
            cross_attn: self.cross_attn.as_ref().map(|kv| kv.select_batch(indices)),
        }
    }
}

/// Owned decoder cache, moved into each step and handed back updated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecoderCache {
    layers: Vec<LayerCache>,
}

impl DecoderCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![LayerCache::default(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache> {
        self.layers.get(layer_idx)
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    fn layer_mut(&mut self, layer_idx: usize) -> Result<&mut LayerCache> {
        let num_layers = self.layers.len();
        self.layers.get_mut(layer_idx).ok_or_else(|| {
            anyhow!(
                "layer index {} out of bounds (num_layers={})",
                layer_idx,
                num_layers
            )
        })
    }

    /// Every entry of every layer shares one batch size.
    fn check_batch(&self, layer_idx: usize, batch: usize) -> Result<()> {
        match self.entry_batch_size() {
            Some(expected) if expected != batch => bail!(
                "layer {} entry has batch size {}, cache holds batch size {}",
                layer_idx,
                batch,
                expected
            ),
            _ => Ok(()),
        }
    }

    fn entry_batch_size(&self) -> Option<usize> {
        self.layers.iter().find_map(LayerCache::batch_size)
    }

    /// Appends new self-attention keys/values along the position axis.
    pub fn append_self_attn(
        &mut self,
        layer_idx: usize,
        key: &Array3<f32>,
        value: &Array3<f32>,
    ) -> Result<()> {
        self.check_batch(layer_idx, key.shape()[0])?;
        let layer = self.layer_mut(layer_idx)?;
        match layer.self_attn.as_mut() {
            Some(kv) => kv.append(key, value),
            None => {
                layer.self_attn = Some(KeyValue::new(key.clone(), value.clone())?);
                Ok(())
            }
        }
    }

    /// Stores the projected encoder keys/values. May only happen once per layer.
    pub fn set_cross_attn(
        &mut self,
        layer_idx: usize,
        key: Array3<f32>,
        value: Array3<f32>,
    ) -> Result<()> {
        self.check_batch(layer_idx, key.shape()[0])?;
        let layer = self.layer_mut(layer_idx)?;
        if layer.cross_attn.is_some() {
            bail!("cross-attention cache of layer {} is already set", layer_idx);
        }
        layer.cross_attn = Some(KeyValue::new(key, value)?);
        Ok(())
    }

    /// Number of decoder positions already cached.
    pub fn self_attn_len(&self) -> usize {
        self.layers
            .first()
            .and_then(|l| l.self_attn.as_ref())
            .map_or(0, KeyValue::seq_len)
    }

    /// Batch size of the cached tensors, `0` for an empty cache.
    pub fn batch_size(&self) -> usize {
        self.entry_batch_size().unwrap_or(0)
    }

    /// Gathers every layer's entries along the batch axis with the same
    /// `indices`. `indices` may be shorter or longer than the batch.
    pub fn reorder(&self, indices: &[usize]) -> Result<Self> {
        let batch_size = self.batch_size();
        if let Some(&bad) = indices.iter().find(|&&idx| idx >= batch_size) {
            bail!(
                "reorder index {} out of range for batch size {}",
                bad,
                batch_size
            );
        }

        let layers = self
            .layers
            .par_iter()
            .map(|layer| layer.reorder(indices))
            .collect();

        Ok(Self { layers })
    }

    /// Consuming variant of [`DecoderCache::reorder`].
    pub fn into_reordered(self, indices: &[usize]) -> Result<Self> {
        let is_identity = indices.len() == self.batch_size()
            && indices.iter().enumerate().all(|(i, &idx)| i == idx);
        if is_identity {
            return Ok(self);
        }
        self.reorder(indices)
    }
}
