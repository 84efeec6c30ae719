//! Decoder dimensions and the numeric-precision tuning policy.

use std::ops::RangeInclusive;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::tuning::GemmAlgo;

/// Immutable shape parameters of one decoder layer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderDims {
    pub batch_size: usize,
    pub max_seq_len: usize,
    pub head_num: usize,
    pub size_per_head: usize,
    /// Hidden size of the encoder memory attended by cross attention.
    pub memory_hidden_size: usize,
}

impl DecoderDims {
    pub fn new(
        batch_size: usize,
        max_seq_len: usize,
        head_num: usize,
        size_per_head: usize,
        memory_hidden_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 || max_seq_len == 0 {
            bail!(
                "invalid decoder dims: batch_size={}, max_seq_len={}",
                batch_size,
                max_seq_len
            );
        }
        if head_num == 0 || size_per_head == 0 {
            bail!(
                "invalid decoder dims: head_num={}, size_per_head={}",
                head_num,
                size_per_head
            );
        }

        Ok(Self {
            batch_size,
            max_seq_len,
            head_num,
            size_per_head,
            memory_hidden_size,
        })
    }

    /// Hidden width of the layer. Always `head_num * size_per_head`.
    #[inline]
    pub fn hidden_size(&self) -> usize {
        self.head_num * self.size_per_head
    }

    /// Element count of one `[batch, hidden]` step tensor.
    #[inline]
    pub fn step_len(&self) -> usize {
        self.batch_size * self.hidden_size()
    }
}

/// Numeric precision of the gemm execution path.
///
/// Keys the algorithm-selector policy: each precision owns a disjoint range
/// of valid backend algorithm ids and its own general-purpose default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[serde(alias = "f32", alias = "full")]
    Fp32,
    #[serde(alias = "f16", alias = "half")]
    Fp16,
}

impl Precision {
    /// The backend's general-purpose algorithm for this precision.
    pub fn default_algo(self) -> GemmAlgo {
        match self {
            Precision::Fp32 => GemmAlgo(-1),
            Precision::Fp16 => GemmAlgo(99),
        }
    }

    /// Valid algorithm-id span for this precision. The two spans are
    /// disjoint; tensor-op ids are meaningless on the full-precision path.
    pub fn algo_range(self) -> RangeInclusive<i32> {
        match self {
            Precision::Fp32 => -1..=23,
            Precision::Fp16 => 99..=115,
        }
    }
}
