//! Key/value caches carried across decoding steps.
//!
//! Self-attention caches grow one position per step. Cross-attention caches
//! hold the projected encoder memory and are primed once on the first step,
//! then read-only for the rest of the sequence.

use anyhow::{bail, Result};
use ndarray::{s, Array3, ArrayView3};

use crate::config::DecoderDims;

/// One cache tensor, laid out `[batch, max_len, hidden]`.
#[derive(Debug, Clone)]
pub struct KvCache {
    data: Array3<f32>,
}

impl KvCache {
    pub fn new(batch_size: usize, max_len: usize, hidden_size: usize) -> Self {
        Self {
            data: Array3::zeros((batch_size, max_len, hidden_size)),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.data.dim().0
    }

    pub fn max_len(&self) -> usize {
        self.data.dim().1
    }

    pub fn hidden_size(&self) -> usize {
        self.data.dim().2
    }

    /// Writes one `[batch, hidden]` slab at `position`. Rewriting an
    /// already-written position is allowed; a retried step simply
    /// overwrites its own slot.
    pub fn write_position(&mut self, position: usize, values: &[f32]) -> Result<()> {
        let (batch, max_len, hidden) = self.data.dim();
        if position >= max_len {
            bail!("cache position {position} out of range, max_len is {max_len}");
        }
        if values.len() != batch * hidden {
            bail!(
                "cache slab has {} elements, expected {}",
                values.len(),
                batch * hidden
            );
        }
        for b in 0..batch {
            let row = &values[b * hidden..(b + 1) * hidden];
            self.data
                .slice_mut(s![b, position, ..])
                .iter_mut()
                .zip(row)
                .for_each(|(dst, &src)| *dst = src);
        }
        Ok(())
    }

    /// Read-only view of the first `len` positions.
    pub fn valid(&self, len: usize) -> Result<ArrayView3<'_, f32>> {
        if len > self.max_len() {
            bail!("requested {len} cached positions, max_len is {}", self.max_len());
        }
        Ok(self.data.slice(s![.., ..len, ..]))
    }
}

/// The four caches one decoder layer carries: growing self-attention
/// key/value pairs plus the projected encoder memory pair.
#[derive(Debug, Clone)]
pub struct StepCaches {
    pub self_keys: KvCache,
    pub self_values: KvCache,
    pub memory_keys: KvCache,
    pub memory_values: KvCache,
    memory_primed: bool,
}

impl StepCaches {
    /// `memory_max_len` is the longest encoder sequence the memory caches
    /// must hold; the self caches are sized by the decoder's own limit.
    pub fn new(dims: &DecoderDims, memory_max_len: usize) -> Self {
        let hidden = dims.hidden_size();
        Self {
            self_keys: KvCache::new(dims.batch_size, dims.max_seq_len, hidden),
            self_values: KvCache::new(dims.batch_size, dims.max_seq_len, hidden),
            memory_keys: KvCache::new(dims.batch_size, memory_max_len, hidden),
            memory_values: KvCache::new(dims.batch_size, memory_max_len, hidden),
            memory_primed: false,
        }
    }

    pub fn memory_primed(&self) -> bool {
        self.memory_primed
    }

    pub fn mark_memory_primed(&mut self) {
        self.memory_primed = true;
    }
}
